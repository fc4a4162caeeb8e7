//! [`Dispatcher`]: authorization, store calls, journaling and fan-out.

use std::sync::Arc;
use std::time::Instant;

use atlas_journal::{CommitLog, Enqueued};
use atlas_meta::{MetaError, OwnershipRegistry};
use atlas_store::LayerStore;
use atlas_types::{AccessKey, Customer, DatasourceId, JournalEntry, LayerChanged, VERSION};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::command::{Caller, Command, Outcome};
use crate::error::EngineError;
use crate::hub::{LiveView, SubscriberHub};
use crate::importer::Importer;

type Result<T> = std::result::Result<T, EngineError>;

/// Protocol-agnostic command executor.
///
/// Write pipeline for every mutation: apply to the store or registry, enqueue
/// exactly one commit log entry, then (layer writes only) broadcast a
/// [`LayerChanged`] event. A failed first step stops the pipeline.
pub struct Dispatcher {
    registry: Arc<OwnershipRegistry>,
    store: Arc<dyn LayerStore>,
    journal: CommitLog,
    hub: Arc<SubscriberHub>,
    importer: Importer,
    started: Instant,
}

impl Dispatcher {
    /// Create a dispatcher over the given components.
    pub fn new(
        registry: Arc<OwnershipRegistry>,
        store: Arc<dyn LayerStore>,
        journal: CommitLog,
        hub: Arc<SubscriberHub>,
        importer: Importer,
    ) -> Self {
        Self {
            registry,
            store,
            journal,
            hub,
            importer,
            started: Instant::now(),
        }
    }

    /// The subscriber hub live views attach to.
    pub fn hub(&self) -> &Arc<SubscriberHub> {
        &self.hub
    }

    /// Seconds since the dispatcher was created.
    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Run `command` in its own task so it completes even if the caller goes away.
    pub async fn dispatch_detached(self: &Arc<Self>, caller: Caller, command: Command) -> Result<Outcome> {
        let this = self.clone();
        let method = command.method();
        tokio::spawn(async move { this.dispatch(&caller, command).await })
            .await
            .map_err(|e| {
                error!(method, error = %e, "command task failed");
                EngineError::Storage(format!("command task failed: {e}"))
            })?
    }

    /// Open a live view of `datasource` after the same ownership check reads get.
    pub async fn open_view(&self, caller: &Caller, datasource: DatasourceId) -> Result<LiveView> {
        self.authorize(caller, &datasource)?;
        if !self.store.has_layer(&datasource).await? {
            return Err(EngineError::NotFound(format!("layer not found: {datasource}")));
        }
        info!(%datasource, "live view opened");
        Ok(self.hub.open_view(datasource))
    }

    /// Authorize and execute one command.
    pub async fn dispatch(&self, caller: &Caller, command: Command) -> Result<Outcome> {
        let method = command.method();
        let result = self.execute(caller, command).await;
        match &result {
            Ok(_) => debug!(method, caller = ?caller.key(), "command ok"),
            Err(e) if e.is_expected() => {
                info!(method, caller = ?caller.key(), error = %e, "command rejected")
            }
            Err(e) => error!(method, caller = ?caller.key(), error = %e, "command failed"),
        }
        result
    }

    async fn execute(&self, caller: &Caller, command: Command) -> Result<Outcome> {
        if command.is_administrative() && *caller != Caller::Trusted {
            return Err(EngineError::Unauthorized(format!(
                "{} requires the superuser key",
                command.method()
            )));
        }

        match command {
            Command::Ping => Ok(Outcome::Pong {
                version: VERSION,
                uptime_secs: self.uptime_secs(),
            }),
            Command::CreateApikey => self.create_apikey(),
            Command::InsertApikey { customer } => self.insert_apikey(customer),
            Command::ExportApikeys => Ok(Outcome::AccessKeys(self.registry.list_customers()?)),
            Command::ExportApikey { apikey } => self.export_apikey(caller, apikey),
            Command::AssignDatasource { apikey, datasource } => {
                self.assign_datasource(caller, apikey, datasource).await
            }
            Command::CreateDatasource { datasource, layer } => {
                self.create_datasource(caller, datasource, layer).await
            }
            Command::DeleteDatasource { datasource } => self.delete_datasource(caller, datasource).await,
            Command::InsertFeature {
                datasource,
                feature,
            } => {
                self.authorize(caller, &datasource)?;
                let geo_id = self.store.insert_feature(&datasource, feature.clone()).await?;
                let mut feature = feature;
                if feature.geo_id().is_none() {
                    feature.set_geo_id(geo_id.clone());
                }
                self.record(
                    "insert_feature",
                    json!({"apikey": caller.key(), "datasource": datasource, "geo_id": geo_id, "feature": feature}),
                    Some(&datasource),
                );
                Ok(Outcome::FeatureRef { datasource, geo_id })
            }
            Command::EditFeature {
                datasource,
                geo_id,
                feature,
            } => {
                self.authorize(caller, &datasource)?;
                let feature = self.store.edit_feature(&datasource, &geo_id, feature).await?;
                self.record(
                    "edit_feature",
                    json!({"apikey": caller.key(), "datasource": datasource, "geo_id": geo_id, "feature": feature}),
                    Some(&datasource),
                );
                Ok(Outcome::FeatureRef { datasource, geo_id })
            }
            Command::ExportDatasources => Ok(Outcome::Datasources(self.store.get_layers().await?)),
            Command::ExportDatasource { datasource } => {
                self.authorize(caller, &datasource)?;
                Ok(Outcome::Layer(self.store.get_layer(&datasource).await?))
            }
            Command::ExportFeature { datasource, geo_id } => {
                self.authorize(caller, &datasource)?;
                let layer = self.store.get_layer(&datasource).await?;
                let feature = layer.find(&geo_id).cloned().ok_or_else(|| {
                    EngineError::NotFound(format!("feature {geo_id} not found in layer {datasource}"))
                })?;
                Ok(Outcome::Feature(feature))
            }
            Command::ExportSnapshots { datasource } => {
                self.authorize(caller, &datasource)?;
                let series = self.store.select_timeseries(&datasource).await?;
                Ok(Outcome::Timestamps(series.snapshots()))
            }
            Command::ExportSnapshot {
                datasource,
                timestamp,
            } => {
                self.authorize(caller, &datasource)?;
                let snapshot = self.store.previous_by_timestamp(&datasource, timestamp).await?;
                Ok(Outcome::Layer(snapshot.collection))
            }
            Command::ImportFile { file } => {
                self.known_caller(caller)?;
                let collection = self.importer.load(&file).await?;
                let datasource = DatasourceId::generate();
                self.store.insert_layer(&datasource, collection).await?;
                self.grant_to_caller(caller, &datasource)?;
                self.record(
                    "import_file",
                    json!({"apikey": caller.key(), "file": file, "datasource": datasource}),
                    Some(&datasource),
                );
                Ok(Outcome::Datasource(datasource))
            }
        }
    }

    // ----- Authorization -----

    /// Load the caller's record fresh. Trusted callers have none.
    fn known_caller(&self, caller: &Caller) -> Result<Option<Customer>> {
        match caller {
            Caller::Trusted => Ok(None),
            Caller::Key(key) => match self.registry.get_customer(key) {
                Ok(customer) => Ok(Some(customer)),
                Err(e) if e.is_not_found() => Err(EngineError::Unauthorized(format!("unknown access key {key}"))),
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Require that `caller` owns `datasource`. Runs before any store call.
    fn authorize(&self, caller: &Caller, datasource: &DatasourceId) -> Result<()> {
        match self.known_caller(caller)? {
            None => Ok(()),
            Some(customer) if customer.has_datasource(datasource) => Ok(()),
            Some(customer) => Err(EngineError::Unauthorized(format!(
                "{} does not own {datasource}",
                customer.apikey
            ))),
        }
    }

    fn grant_to_caller(&self, caller: &Caller, datasource: &DatasourceId) -> Result<()> {
        if let Caller::Key(key) = caller {
            self.registry.add_datasource(key, datasource)?;
        }
        Ok(())
    }

    // ----- Pipeline tail -----

    /// Enqueue the journal entry and, for layer writes, notify viewers.
    fn record(&self, method: &'static str, data: serde_json::Value, datasource: Option<&DatasourceId>) {
        if self.journal.enqueue(JournalEntry::new(method, data)) == Enqueued::Dropped {
            warn!(method, "mutation applied but its commit log entry was dropped");
        }
        if let Some(datasource) = datasource {
            let delivered = self.hub.broadcast(&LayerChanged {
                datasource: datasource.clone(),
                method: method.to_string(),
                timestamp: atlas_types::now_millis(),
            });
            debug!(method, %datasource, delivered, "broadcast layer change");
        }
    }

    // ----- Registry commands -----

    fn create_apikey(&self) -> Result<Outcome> {
        let customer = self.registry.create_customer()?;
        self.record("create_apikey", json!({"apikey": customer.apikey}), None);
        Ok(Outcome::Customer(customer))
    }

    fn insert_apikey(&self, customer: Customer) -> Result<Outcome> {
        self.registry.put_customer(&customer)?;
        let stored = self.registry.get_customer(&customer.apikey)?;
        self.record("insert_apikey", json!(stored), None);
        Ok(Outcome::Customer(stored))
    }

    fn export_apikey(&self, caller: &Caller, apikey: Option<AccessKey>) -> Result<Outcome> {
        let target = match (caller, apikey) {
            (Caller::Key(own), Some(requested)) if *own != requested => {
                return Err(EngineError::Unauthorized(format!("{own} cannot read {requested}")));
            }
            (Caller::Key(own), _) => own.clone(),
            (Caller::Trusted, Some(requested)) => requested,
            (Caller::Trusted, None) => {
                return Err(EngineError::BadRequest("missing required field: apikey".into()));
            }
        };
        match self.registry.get_customer(&target) {
            Ok(customer) => Ok(Outcome::Customer(customer)),
            Err(e) if e.is_not_found() && matches!(caller, Caller::Key(_)) => {
                Err(EngineError::Unauthorized(format!("unknown access key {target}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn assign_datasource(
        &self,
        caller: &Caller,
        apikey: Option<AccessKey>,
        datasource: DatasourceId,
    ) -> Result<Outcome> {
        // A keyed caller claims the datasource for itself.
        let target = match caller {
            Caller::Key(key) => {
                self.known_caller(caller)?;
                key.clone()
            }
            Caller::Trusted => apikey.ok_or_else(|| EngineError::BadRequest("missing required field: apikey".into()))?,
        };

        if !self.store.has_layer(&datasource).await? {
            return Err(EngineError::NotFound(format!("layer not found: {datasource}")));
        }
        let customer = self.registry.add_datasource(&target, &datasource)?;
        self.record(
            "assign_datasource",
            json!({"apikey": target, "datasource": datasource}),
            None,
        );
        Ok(Outcome::Customer(customer))
    }

    // ----- Layer lifecycle -----

    async fn create_datasource(
        &self,
        caller: &Caller,
        datasource: Option<DatasourceId>,
        layer: Option<atlas_types::FeatureCollection>,
    ) -> Result<Outcome> {
        let customer = self.known_caller(caller)?;

        let datasource = match datasource {
            Some(id) => {
                // A keyed caller may only name datasources it already owns.
                if let Some(customer) = &customer
                    && !customer.has_datasource(&id)
                {
                    return Err(EngineError::Unauthorized(format!(
                        "{} does not own {id}",
                        customer.apikey
                    )));
                }
                self.store
                    .insert_layer(&id, layer.unwrap_or_default())
                    .await?;
                id
            }
            None => match layer {
                Some(layer) => {
                    let id = DatasourceId::generate();
                    self.store.insert_layer(&id, layer).await?;
                    id
                }
                None => self.store.new_layer().await?,
            },
        };

        self.grant_to_caller(caller, &datasource)?;
        self.record(
            "create_datasource",
            json!({"apikey": caller.key(), "datasource": datasource}),
            Some(&datasource),
        );
        info!(%datasource, "created datasource");
        Ok(Outcome::Datasource(datasource))
    }

    async fn delete_datasource(&self, caller: &Caller, datasource: DatasourceId) -> Result<Outcome> {
        self.authorize(caller, &datasource)?;

        // Both steps always run; revoked ownership is never restored.
        let (revoked, registry_err) = self.revoke_all(&datasource);
        let store_result = self.store.delete_layer(&datasource).await;

        match (registry_err, store_result) {
            (None, Ok(())) => {}
            (None, Err(e)) if e.is_not_found() => return Err(e.into()),
            (registry_err, store_result) => {
                let mut failed = Vec::new();
                if let Some(e) = registry_err {
                    failed.push(format!("ownership removal failed: {e}"));
                }
                if let Err(e) = store_result {
                    failed.push(format!("layer deletion failed: {e}"));
                }
                let failed = failed.join("; ");
                error!(%datasource, revoked, error = %failed, "datasource deletion incomplete");
                return Err(EngineError::Storage(format!(
                    "deletion of {datasource} incomplete, {revoked} ownership grants removed: {failed}"
                )));
            }
        }

        self.record(
            "delete_datasource",
            json!({"apikey": caller.key(), "datasource": datasource}),
            Some(&datasource),
        );
        info!(%datasource, revoked, "deleted datasource");
        Ok(Outcome::Done)
    }

    /// Remove `datasource` from every owner. Returns how many grants were
    /// removed and the first registry error, continuing past failures.
    fn revoke_all(&self, datasource: &DatasourceId) -> (usize, Option<MetaError>) {
        let owners = match self.registry.owners_of(datasource) {
            Ok(owners) => owners,
            Err(e) => {
                warn!(%datasource, error = %e, "could not list datasource owners");
                return (0, Some(e));
            }
        };
        let mut revoked = 0;
        let mut first_err = None;
        for owner in &owners {
            match self.registry.remove_datasource(owner, datasource) {
                Ok(_) => revoked += 1,
                Err(e) => {
                    warn!(%datasource, apikey = %owner, error = %e, "could not revoke datasource");
                    first_err.get_or_insert(e);
                }
            }
        }
        (revoked, first_err)
    }
}
