// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Loading and saving of node configuration files.
//!
//! The format follows the file extension: `.yaml` / `.yml` files are YAML,
//! everything else is JSON.

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("yaml") | Some("yml")
    )
}

pub trait Config: Serialize + DeserializeOwned {
    fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {:?}", path))?;
        let config: Self = if is_yaml(path) {
            serde_yaml::from_str(&content)
                .with_context(|| format!("invalid yaml config {:?}", path))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("invalid json config {:?}", path))?
        };
        Ok(config)
    }

    fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = if is_yaml(path) {
            serde_yaml::to_string(self)?
        } else {
            serde_json::to_string_pretty(self)?
        };
        std::fs::write(path, content)
            .with_context(|| format!("unable to write config file {:?}", path))?;
        Ok(())
    }
}
