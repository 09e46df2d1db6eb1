use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// Variables published for external up/down scripts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvSet {
    vars: BTreeMap<String, String>,
}

impl EnvSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        log::debug!("setenv {name}={value}");
        self.vars.insert(name.to_string(), value);
    }

    pub fn set_addr(&mut self, name: &str, addr: Ipv4Addr) {
        self.set(name, addr.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.vars.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Apply every variable to a child process command.
    pub fn apply(&self, command: &mut std::process::Command) {
        command.envs(self.vars.iter());
    }
}
