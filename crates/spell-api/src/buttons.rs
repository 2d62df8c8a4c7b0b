// SPDX-License-Identifier: MIT OR Apache-2.0
//! Button registry.
//!
//! A button is a curated parameterization of a spell: default input,
//! role and tenant gates, and required confirmations. The registry file
//! is loaded once at server start and treated as immutable.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

/// Confirmations a button demands from the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequiredConfirmations {
    /// Caller must acknowledge the spell's risk.
    #[serde(default)]
    pub risk: bool,
    /// Caller must acknowledge billing.
    #[serde(default)]
    pub billing: bool,
}

/// One curated button.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Button {
    /// Spell the button casts.
    pub spell_id: String,
    /// Pinned version; latest installed when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Default input merged under the request input.
    #[serde(default)]
    pub defaults: Map<String, Value>,
    /// Confirmations the caller must send.
    #[serde(default)]
    pub required_confirmations: RequiredConfirmations,
    /// Roles allowed to press the button.
    pub allowed_roles: Vec<String>,
    /// Tenants allowed to press the button; `None` allows all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tenants: Option<Vec<String>>,
    /// Demand a verified bundle signature for this button.
    #[serde(default)]
    pub require_signature: bool,
}

impl Button {
    /// Merge `defaults ⊕ request input` (request wins per key).
    #[must_use]
    pub fn merged_input(&self, request: Option<&Map<String, Value>>) -> Map<String, Value> {
        let mut merged = self.defaults.clone();
        if let Some(request) = request {
            for (k, v) in request {
                merged.insert(k.clone(), v.clone());
            }
        }
        merged
    }
}

/// The immutable registry of buttons, keyed by button id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ButtonRegistry {
    /// All buttons.
    #[serde(default)]
    pub buttons: BTreeMap<String, Button>,
}

impl ButtonRegistry {
    /// Load the registry file; absent file means an empty registry.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("parse button registry {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("read button registry {}", path.display())),
        }
    }

    /// Look up a button.
    #[must_use]
    pub fn get(&self, button_id: &str) -> Option<&Button> {
        self.buttons.get(button_id)
    }
}
