//! The operation table: [`Command`], its arguments, and its [`Outcome`].

use std::path::PathBuf;

use atlas_types::{AccessKey, Customer, DatasourceId, Feature, FeatureCollection, TileLayer, Timestamp};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::warn;

use crate::error::EngineError;

/// Who is issuing a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    /// A customer identified by its access key. Ownership is enforced.
    Key(AccessKey),
    /// A caller inside the trust boundary (loopback socket without a key,
    /// or an HTTP request that presented the superuser key).
    Trusted,
}

impl Caller {
    /// The caller's access key, if any.
    pub fn key(&self) -> Option<&AccessKey> {
        match self {
            Self::Key(k) => Some(k),
            Self::Trusted => None,
        }
    }
}

/// A normalized request, independent of the transport it arrived on.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ping,
    CreateApikey,
    InsertApikey {
        customer: Customer,
    },
    ExportApikeys,
    ExportApikey {
        apikey: Option<AccessKey>,
    },
    AssignDatasource {
        apikey: Option<AccessKey>,
        datasource: DatasourceId,
    },
    CreateDatasource {
        datasource: Option<DatasourceId>,
        layer: Option<FeatureCollection>,
    },
    DeleteDatasource {
        datasource: DatasourceId,
    },
    InsertFeature {
        datasource: DatasourceId,
        feature: Feature,
    },
    EditFeature {
        datasource: DatasourceId,
        geo_id: String,
        feature: Feature,
    },
    ExportDatasources,
    ExportDatasource {
        datasource: DatasourceId,
    },
    ExportFeature {
        datasource: DatasourceId,
        geo_id: String,
    },
    ExportSnapshots {
        datasource: DatasourceId,
    },
    ExportSnapshot {
        datasource: DatasourceId,
        timestamp: Timestamp,
    },
    ImportFile {
        file: PathBuf,
    },
}

/// Raw, all-optional command arguments as they appear on the wire.
///
/// Top-level fields win; `data` carries fallbacks for older clients.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommandArgs {
    pub apikey: Option<AccessKey>,
    pub datasource: Option<DatasourceId>,
    pub geo_id: Option<Value>,
    pub file: Option<PathBuf>,
    pub timestamp: Option<Value>,
    pub layer: Option<Value>,
    pub feature: Option<Value>,
    pub data: Option<CommandData>,
}

/// Nested `data` object of a request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommandData {
    pub apikey: Option<AccessKey>,
    pub datasources: Option<Vec<DatasourceId>>,
    pub tilelayers: Option<Vec<TileLayer>>,
    pub datasource: Option<DatasourceId>,
    pub geo_id: Option<Value>,
    pub timestamp: Option<Value>,
    pub layer: Option<Value>,
    pub feature: Option<Value>,
}

/// Every method name accepted by [`Command::from_method`], aliases included.
pub const METHODS: &[&str] = &[
    "ping",
    "help",
    "create_apikey",
    "insert_apikey",
    "export_apikeys",
    "export_apikey",
    "assign_datasource",
    "create_datasource",
    "insert_layer",
    "delete_datasource",
    "delete_layer",
    "insert_feature",
    "edit_feature",
    "export_datasources",
    "export_datasource",
    "export_layer",
    "export_feature",
    "export_snapshots",
    "export_snapshot",
    "import_file",
];

fn missing(field: &str) -> EngineError {
    EngineError::BadRequest(format!("missing required field: {field}"))
}

/// Render a scalar argument as text: strings as-is, numbers in decimal.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Decode a JSON argument, accepting either an object or a string holding one.
fn decode<T: serde::de::DeserializeOwned>(field: &str, value: Value) -> Result<T, EngineError> {
    let parsed = match value {
        Value::String(s) => serde_json::from_str(&s),
        other => serde_json::from_value(other),
    };
    parsed.map_err(|e| EngineError::BadRequest(format!("invalid {field}: {e}")))
}

impl CommandArgs {
    fn data(&self) -> Option<&CommandData> {
        self.data.as_ref()
    }

    fn apikey(&self) -> Option<AccessKey> {
        self.apikey
            .clone()
            .or_else(|| self.data()?.apikey.clone())
    }

    fn data_apikey(&self) -> Option<AccessKey> {
        self.data()
            .and_then(|d| d.apikey.clone())
            .or_else(|| self.apikey.clone())
    }

    fn datasource(&self) -> Option<DatasourceId> {
        self.datasource
            .clone()
            .or_else(|| self.data()?.datasource.clone())
            .filter(|d| !d.is_empty())
    }

    fn require_datasource(&self) -> Result<DatasourceId, EngineError> {
        self.datasource().ok_or_else(|| missing("datasource"))
    }

    fn require_geo_id(&self) -> Result<String, EngineError> {
        self.geo_id
            .as_ref()
            .or_else(|| self.data()?.geo_id.as_ref())
            .and_then(scalar_text)
            .ok_or_else(|| missing("geo_id"))
    }

    fn require_timestamp(&self) -> Result<Timestamp, EngineError> {
        let value = self
            .timestamp
            .as_ref()
            .or_else(|| self.data()?.timestamp.as_ref())
            .ok_or_else(|| missing("timestamp"))?;
        scalar_text(value)
            .and_then(|s| s.parse::<Timestamp>().ok())
            .ok_or_else(|| EngineError::BadRequest(format!("invalid timestamp: {value}")))
    }

    fn take_feature(&mut self) -> Result<Feature, EngineError> {
        let value = self
            .feature
            .take()
            .or_else(|| self.data.as_mut()?.feature.take())
            .ok_or_else(|| missing("feature"))?;
        decode("feature", value)
    }

    fn take_layer(&mut self) -> Result<Option<FeatureCollection>, EngineError> {
        match self
            .layer
            .take()
            .or_else(|| self.data.as_mut()?.layer.take())
        {
            None | Some(Value::Null) => Ok(None),
            Some(value) => decode("layer", value).map(Some),
        }
    }
}

impl Command {
    /// Look up `method` in the operation table and build the command from `args`.
    ///
    /// Unknown methods yield `BadRequest("method not found: <method>")`.
    pub fn from_method(method: &str, mut args: CommandArgs) -> Result<Self, EngineError> {
        let cmd = match method {
            "ping" => Self::Ping,
            "create_apikey" => Self::CreateApikey,
            "insert_apikey" => {
                let apikey = args
                    .data_apikey()
                    .filter(|k| !k.is_empty())
                    .ok_or_else(|| missing("apikey"))?;
                let data = args.data.take().unwrap_or_default();
                let datasources = data.datasources.ok_or_else(|| missing("datasources"))?;
                let mut customer = Customer::new(apikey);
                customer.datasources = datasources;
                customer.tilelayers = data.tilelayers.unwrap_or_default();
                Self::InsertApikey { customer }
            }
            "export_apikeys" => Self::ExportApikeys,
            "export_apikey" => Self::ExportApikey {
                apikey: args.apikey(),
            },
            "assign_datasource" => Self::AssignDatasource {
                apikey: args.data_apikey(),
                datasource: args.require_datasource()?,
            },
            "create_datasource" | "insert_layer" => Self::CreateDatasource {
                datasource: args.datasource(),
                layer: args.take_layer()?,
            },
            "delete_datasource" | "delete_layer" => Self::DeleteDatasource {
                datasource: args.require_datasource()?,
            },
            "insert_feature" => Self::InsertFeature {
                datasource: args.require_datasource()?,
                feature: args.take_feature()?,
            },
            "edit_feature" => Self::EditFeature {
                datasource: args.require_datasource()?,
                geo_id: args.require_geo_id()?,
                feature: args.take_feature()?,
            },
            "export_datasources" => Self::ExportDatasources,
            "export_datasource" | "export_layer" => Self::ExportDatasource {
                datasource: args.require_datasource()?,
            },
            "export_feature" => Self::ExportFeature {
                datasource: args.require_datasource()?,
                geo_id: args.require_geo_id()?,
            },
            "export_snapshots" => Self::ExportSnapshots {
                datasource: args.require_datasource()?,
            },
            "export_snapshot" => Self::ExportSnapshot {
                datasource: args.require_datasource()?,
                timestamp: args.require_timestamp()?,
            },
            "import_file" => Self::ImportFile {
                file: args.file.take().ok_or_else(|| missing("file"))?,
            },
            other => {
                return Err(EngineError::BadRequest(format!("method not found: {other}")));
            }
        };
        Ok(cmd)
    }

    /// Canonical method name (aliases resolve to their canonical form).
    pub fn method(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::CreateApikey => "create_apikey",
            Self::InsertApikey { .. } => "insert_apikey",
            Self::ExportApikeys => "export_apikeys",
            Self::ExportApikey { .. } => "export_apikey",
            Self::AssignDatasource { .. } => "assign_datasource",
            Self::CreateDatasource { .. } => "create_datasource",
            Self::DeleteDatasource { .. } => "delete_datasource",
            Self::InsertFeature { .. } => "insert_feature",
            Self::EditFeature { .. } => "edit_feature",
            Self::ExportDatasources => "export_datasources",
            Self::ExportDatasource { .. } => "export_datasource",
            Self::ExportFeature { .. } => "export_feature",
            Self::ExportSnapshots { .. } => "export_snapshots",
            Self::ExportSnapshot { .. } => "export_snapshot",
            Self::ImportFile { .. } => "import_file",
        }
    }

    /// Registry-wide commands reserved for trusted callers.
    pub fn is_administrative(&self) -> bool {
        matches!(
            self,
            Self::CreateApikey | Self::InsertApikey { .. } | Self::ExportApikeys | Self::ExportDatasources
        )
    }

    /// Commands that change the store or the registry (and are journaled).
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Self::CreateApikey
                | Self::InsertApikey { .. }
                | Self::AssignDatasource { .. }
                | Self::CreateDatasource { .. }
                | Self::DeleteDatasource { .. }
                | Self::InsertFeature { .. }
                | Self::EditFeature { .. }
                | Self::ImportFile { .. }
        )
    }

    /// The datasource this command names, if any.
    pub fn datasource(&self) -> Option<&DatasourceId> {
        match self {
            Self::AssignDatasource { datasource, .. }
            | Self::DeleteDatasource { datasource }
            | Self::InsertFeature { datasource, .. }
            | Self::EditFeature { datasource, .. }
            | Self::ExportDatasource { datasource }
            | Self::ExportFeature { datasource, .. }
            | Self::ExportSnapshots { datasource }
            | Self::ExportSnapshot { datasource, .. } => Some(datasource),
            Self::CreateDatasource { datasource, .. } => datasource.as_ref(),
            _ => None,
        }
    }
}

/// Successful result of a command.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Pong {
        version: &'static str,
        uptime_secs: u64,
    },
    Customer(Customer),
    AccessKeys(Vec<AccessKey>),
    Datasource(DatasourceId),
    Datasources(Vec<DatasourceId>),
    Layer(FeatureCollection),
    Feature(Feature),
    FeatureRef {
        datasource: DatasourceId,
        geo_id: String,
    },
    Timestamps(Vec<Timestamp>),
    Done,
}

impl Outcome {
    /// JSON form used as the `data` member of a response envelope.
    pub fn to_json(&self) -> Value {
        let value = match self {
            Self::Pong {
                version,
                uptime_secs,
            } => Ok(json!({"message": "pong", "version": version, "uptime_secs": uptime_secs})),
            Self::Customer(c) => serde_json::to_value(c),
            Self::AccessKeys(keys) => serde_json::to_value(keys),
            Self::Datasource(id) => Ok(json!({ "datasource": id })),
            Self::Datasources(ids) => serde_json::to_value(ids),
            Self::Layer(fc) => serde_json::to_value(fc),
            Self::Feature(f) => serde_json::to_value(f),
            Self::FeatureRef { datasource, geo_id } => {
                Ok(json!({"datasource": datasource, "geo_id": geo_id}))
            }
            Self::Timestamps(ts) => serde_json::to_value(ts),
            Self::Done => Ok(Value::Null),
        };
        json_or_null(value, self.kind())
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Pong { .. } => "pong",
            Self::Customer(_) => "customer",
            Self::AccessKeys(_) => "access_keys",
            Self::Datasource(_) => "datasource",
            Self::Datasources(_) => "datasources",
            Self::Layer(_) => "layer",
            Self::Feature(_) => "feature",
            Self::FeatureRef { .. } => "feature_ref",
            Self::Timestamps(_) => "timestamps",
            Self::Done => "done",
        }
    }
}

/// Unwrap a serialized outcome, logging and answering `null` on failure.
fn json_or_null(value: serde_json::Result<Value>, kind: &'static str) -> Value {
    value.unwrap_or_else(|e| {
        warn!(kind, error = %e, "outcome could not be serialized");
        Value::Null
    })
}
