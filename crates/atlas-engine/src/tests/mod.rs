//! Tests for the atlas-engine crate.

mod helpers;
