use std::collections::HashMap;

use thiserror::Error;

use super::{ConnContext, Outcome};
use crate::agent::AgentState;
use crate::proto::ParamSet;

/// Accepts or rejects a command's parameters before it is processed.
pub type Validator = fn(&ParamSet) -> bool;
/// Does the work of a command.
pub type Processor = fn(&mut AgentState, &ConnContext, &ParamSet) -> Outcome;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("command registered twice: {0}")]
    Duplicate(String),
    #[error("empty command name")]
    EmptyName,
}

#[derive(Clone, Copy)]
pub struct Registration {
    pub validate: Validator,
    pub process: Processor,
}

/// Validator for commands that take no required parameters.
pub fn any_params(_: &ParamSet) -> bool {
    true
}

/// Collects registrations before the server starts.
#[derive(Default)]
pub struct RegistryBuilder {
    cmds: HashMap<String, Registration>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: &str,
        validate: Validator,
        process: Processor,
    ) -> Result<&mut Self, RegistryError> {
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.cmds.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        self.cmds
            .insert(name.to_string(), Registration { validate, process });
        Ok(self)
    }

    pub fn build(self) -> CommandRegistry {
        CommandRegistry { cmds: self.cmds }
    }
}

/// Frozen name → handler table. Lookups are case-sensitive.
pub struct CommandRegistry {
    cmds: HashMap<String, Registration>,
}

impl CommandRegistry {
    pub fn get(&self, name: &str) -> Option<&Registration> {
        self.cmds.get(name)
    }

    pub fn len(&self) -> usize {
        self.cmds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cmds.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.cmds.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &mut AgentState, _: &ConnContext, _: &ParamSet) -> Outcome {
        Outcome::Complete(None)
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut b = RegistryBuilder::new();
        b.register("sta_get_ip_config", any_params, noop).unwrap();
        assert_eq!(
            b.register("sta_get_ip_config", any_params, noop).err(),
            Some(RegistryError::Duplicate("sta_get_ip_config".into()))
        );
        assert_eq!(
            b.register("", any_params, noop).err(),
            Some(RegistryError::EmptyName)
        );
        let reg = b.build();
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn lookup_is_case_sensitive() {
        let mut b = RegistryBuilder::new();
        b.register("ca_get_version", any_params, noop)
            .unwrap()
            .register("device_get_info", any_params, noop)
            .unwrap();
        let reg = b.build();
        assert!(reg.get("ca_get_version").is_some());
        assert!(reg.get("CA_GET_VERSION").is_none());
        let mut names: Vec<&str> = reg.names().collect();
        names.sort();
        assert_eq!(names, ["ca_get_version", "device_get_info"]);
    }
}
