// src/schema.rs

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use schemars::schema_for;

use crate::flow::Flow;

/// Emit the flow JSON-Schema for the authoring frontend.
pub fn write_schema(out_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(out_dir)?;
    let schema = schema_for!(Flow);
    let path = out_dir.join("flow.schema.json");
    fs::write(&path, serde_json::to_string_pretty(&schema)?)?;
    Ok(path)
}
