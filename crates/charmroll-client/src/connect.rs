//! Connection options shared by every subcommand.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How to reach the controller and which model to operate on.
///
/// With an `endpoint` the model must be given by UUID and the
/// credentials are used directly. Otherwise the local client
/// configuration resolves controller and model names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOptions {
    pub controller: Option<String>,
    pub model: Option<String>,
    pub endpoint: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// PEM-encoded CA certificate of the controller.
    pub cacert: Option<String>,
    /// `juju` executable; found on `PATH` when unset.
    pub juju_binary: Option<PathBuf>,
    /// `charm` executable used for catalog lookups; found on `PATH` when unset.
    pub charm_binary: Option<PathBuf>,
}

impl ConnectOptions {
    pub fn is_remote(&self) -> bool {
        self.endpoint.is_some()
    }

    /// `controller:model` or `model`. `None` when no model was named and
    /// the controller's current model applies.
    pub fn model_selector(&self) -> Option<String> {
        match (&self.controller, &self.model) {
            (Some(ctrl), Some(model)) => Some(format!("{ctrl}:{model}")),
            (None, Some(model)) => Some(model.clone()),
            (_, None) => None,
        }
    }
}
