//! Static module graph and context-to-module mapping.

use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};

use super::error::BootstrapError;

pub const BUS: &str = "bus";
pub const GATEWAY: &str = "gateway";
pub const SYNC: &str = "sync";

/// Extra modules loaded when the context identifier contains `matches`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ContextRule {
  pub matches: String,
  pub modules: Vec<String>,
}

/// Module registry as read from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ModuleRegistry {
  /// Module name → names it depends on
  pub dependencies: BTreeMap<String, Vec<String>>,
  /// Module name → loader source; defaults to the module name
  pub sources: BTreeMap<String, String>,
  /// Modules loaded for every context
  pub base: Vec<String>,
  /// Checked in order; the first matching rule adds its modules
  pub contexts: Vec<ContextRule>,
}

impl ModuleRegistry {
  /// Registry containing only the core components: `bus`, then `gateway`,
  /// then `sync`.
  pub fn core() -> Self {
    Self::default().with_core_modules()
  }

  /// Add the core components, keeping any dependencies already declared for them.
  pub fn with_core_modules(mut self) -> Self {
    let core: [(&str, &[&str]); 3] = [(BUS, &[]), (GATEWAY, &[BUS]), (SYNC, &[BUS, GATEWAY])];
    for (name, deps) in core {
      self
        .dependencies
        .entry(name.to_string())
        .or_insert_with(|| deps.iter().map(|d| d.to_string()).collect());
    }

    let mut base: Vec<String> = [BUS, GATEWAY, SYNC].iter().map(|s| s.to_string()).collect();
    for name in self.base.drain(..) {
      if !base.contains(&name) {
        base.push(name);
      }
    }
    self.base = base;
    self
  }

  pub fn dependencies(&self, name: &str) -> &[String] {
    self
      .dependencies
      .get(name)
      .map(Vec::as_slice)
      .unwrap_or_default()
  }

  pub fn source(&self, name: &str) -> String {
    self
      .sources
      .get(name)
      .cloned()
      .unwrap_or_else(|| name.to_string())
  }

  /// Base modules plus those of the first context rule matching `context`.
  pub fn modules_for_context(&self, context: &str) -> Vec<String> {
    let mut modules = self.base.clone();
    if let Some(rule) = self.contexts.iter().find(|r| context.contains(&r.matches)) {
      for name in &rule.modules {
        if !modules.contains(name) {
          modules.push(name.clone());
        }
      }
    }
    modules
  }

  /// Reject dependency cycles.
  pub fn validate(&self) -> Result<(), BootstrapError> {
    let mut done = HashSet::new();
    for name in self.dependencies.keys() {
      let mut path = Vec::new();
      self.visit(name, &mut path, &mut done)?;
    }
    Ok(())
  }

  fn visit<'a>(
    &'a self,
    name: &'a str,
    path: &mut Vec<&'a str>,
    done: &mut HashSet<&'a str>,
  ) -> Result<(), BootstrapError> {
    if done.contains(name) {
      return Ok(());
    }
    if let Some(start) = path.iter().position(|n| *n == name) {
      let mut cycle: Vec<String> = path[start..].iter().map(|n| n.to_string()).collect();
      cycle.push(name.to_string());
      return Err(BootstrapError::Cycle { path: cycle });
    }

    path.push(name);
    for dep in self.dependencies(name) {
      self.visit(dep, path, done)?;
    }
    path.pop();
    done.insert(name);
    Ok(())
  }
}
