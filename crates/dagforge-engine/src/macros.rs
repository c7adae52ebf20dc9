//! Macro lookup and materialization dispatch
//!
//! Macros are ranked by where they come from: built-in packages, installed
//! packages, or the root project.

use crate::error::MacroError;
use dagforge_core::{Diagnostic, DiagnosticCode};
use dagforge_manifest::{Macro, Manifest};
use std::collections::BTreeSet;

/// Where a macro comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Locality {
    Core,
    Imported,
    Root,
}

impl Locality {
    /// Rank used to break materialization ties: Imported < Core < Root
    fn materialization_rank(self) -> u8 {
        match self {
            Locality::Imported => 0,
            Locality::Core => 1,
            Locality::Root => 2,
        }
    }
}

/// Winning materialization plus any warnings raised while choosing it
#[derive(Debug, Clone)]
pub struct MaterializationMatch {
    pub macro_id: String,
    pub warnings: Vec<Diagnostic>,
}

/// Macro lookups over one manifest
pub struct MacroResolver<'a> {
    manifest: &'a Manifest,
    root_project: String,
    core_packages: BTreeSet<String>,
}

impl<'a> MacroResolver<'a> {
    pub fn new(
        manifest: &'a Manifest,
        root_project: impl Into<String>,
        core_packages: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            manifest,
            root_project: root_project.into(),
            core_packages: core_packages.into_iter().map(Into::into).collect(),
        }
    }

    pub fn root_project(&self) -> &str {
        &self.root_project
    }

    pub fn locality(&self, package: &str) -> Locality {
        if package == self.root_project {
            Locality::Root
        } else if self.core_packages.contains(package) {
            Locality::Core
        } else {
            Locality::Imported
        }
    }

    /// Whether any macro lives in this package
    pub fn is_known_package(&self, package: &str) -> bool {
        self.manifest.macros.values().any(|m| m.package_name == package)
    }

    fn candidates(&self, name: &str) -> impl Iterator<Item = &'a Macro> + '_ {
        let name = name.to_string();
        self.manifest.macros.values().filter(move |m| m.name == name)
    }

    /// Best candidate among the allowed localities
    ///
    /// Candidates sort by locality then package name; the last one wins.
    fn best(&self, name: &str, allowed: &[Locality], package: Option<&str>) -> Option<&'a Macro> {
        let mut found: Vec<(Locality, &str, &'a Macro)> = self
            .candidates(name)
            .filter(|m| package.map_or(true, |p| m.package_name == p))
            .map(|m| (self.locality(&m.package_name), m.package_name.as_str(), m))
            .filter(|(locality, _, _)| allowed.contains(locality))
            .collect();
        found.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        found.pop().map(|(_, _, m)| m)
    }

    /// Generic lookup: Core < Imported < Root, last wins
    pub fn find_macro_by_name(&self, name: &str, package: Option<&str>) -> Option<&'a Macro> {
        self.best(name, &[Locality::Core, Locality::Imported, Locality::Root], package)
    }

    /// Lookup for `generate_*_name` macros
    ///
    /// Only the root project can override the built-in version, unless a
    /// package is named explicitly.
    pub fn find_generate_macro_by_name(&self, name: &str, package: Option<&str>) -> Option<&'a Macro> {
        match package {
            Some(pkg) => self.best(name, &[Locality::Imported], Some(pkg)),
            None => self.best(name, &[Locality::Core, Locality::Root], None),
        }
    }

    /// Resolve a call site inside a node or macro of `node_package`
    ///
    /// `pkg.name` searches that package only. A bare name tries the root
    /// project, then the caller's package, then every package.
    pub fn resolve_call(&self, call: &str, node_package: &str) -> Option<&'a Macro> {
        if let Some((package, name)) = call.split_once('.') {
            return self.find_macro_by_name(name, Some(package));
        }
        self.find_macro_by_name(call, Some(&self.root_project))
            .or_else(|| self.find_macro_by_name(call, Some(node_package)))
            .or_else(|| self.find_macro_by_name(call, None))
    }

    /// Resolve `adapter.dispatch(name, namespace)` against the adapter chain
    ///
    /// Tries `<adapter>__name` for each adapter in the chain, the last entry
    /// being `default`.
    pub fn resolve_dispatch(
        &self,
        macro_name: &str,
        namespace: Option<&str>,
        adapter_chain: &[String],
        node_package: &str,
    ) -> Option<&'a Macro> {
        adapter_chain.iter().find_map(|adapter| {
            let candidate = format!("{}__{}", adapter, macro_name);
            match namespace {
                Some(ns) => self.find_macro_by_name(&candidate, Some(ns)),
                None => self.resolve_call(&candidate, node_package),
            }
        })
    }

    /// Pick the materialization macro for an adapter chain
    pub fn find_materialization(
        &self,
        materialization: &str,
        adapter_chain: &[String],
        require_explicit_package_overrides: bool,
    ) -> Result<MaterializationMatch, MacroError> {
        let mut candidates: Vec<(usize, Locality, &'a Macro)> = Vec::new();
        for (specificity, adapter) in adapter_chain.iter().enumerate() {
            let name = format!("materialization_{}_{}", materialization, adapter);
            for mac in self.candidates(&name) {
                candidates.push((specificity, self.locality(&mac.package_name), mac));
            }
        }

        let adapter = adapter_chain.first().cloned().unwrap_or_else(|| "default".to_string());
        if candidates.is_empty() {
            return Err(MacroError::MaterializationNotFound {
                materialization: materialization.to_string(),
                adapter,
            });
        }

        let has_core = candidates.iter().any(|(_, l, _)| *l == Locality::Core);
        let all: Vec<&(usize, Locality, &'a Macro)> = candidates.iter().collect();
        let mut chosen = pick_materialization(materialization, &adapter, &all)?;

        // Installed packages may only override a built-in with an explicit opt-in
        if require_explicit_package_overrides && has_core && chosen.1 == Locality::Imported {
            let restricted: Vec<_> = candidates
                .iter()
                .filter(|(_, l, _)| matches!(l, Locality::Core | Locality::Root))
                .collect();
            chosen = pick_materialization(materialization, &adapter, &restricted)?;
        }

        let (_, locality, winner) = chosen;
        let mut warnings = Vec::new();
        if *locality == Locality::Imported && has_core && !require_explicit_package_overrides {
            let message = format!(
                "Installed package '{}' is overriding the built-in materialization '{}'. \
                 Overrides of built-in materializations from installed packages will be removed; \
                 set require_explicit_package_overrides_for_builtin_materializations to opt in now",
                winner.package_name, materialization
            );
            tracing::warn!(package = %winner.package_name, materialization, "{}", message);
            warnings.push(
                Diagnostic::warn(DiagnosticCode::PackageMaterializationOverride, message)
                    .with_nodes([winner.unique_id.clone()]),
            );
        }

        Ok(MaterializationMatch {
            macro_id: winner.unique_id.clone(),
            warnings,
        })
    }
}

/// Lowest specificity first, then highest locality rank; ties are an error
fn pick_materialization<'m, 'a>(
    materialization: &str,
    adapter: &str,
    pool: &[&'m (usize, Locality, &'a Macro)],
) -> Result<&'m (usize, Locality, &'a Macro), MacroError> {
    let key = |(s, l, _): &(usize, Locality, &'a Macro)| (*s, std::cmp::Reverse(l.materialization_rank()));
    let best_key = pool
        .iter()
        .map(|c| key(*c))
        .min()
        .ok_or_else(|| MacroError::MaterializationNotFound {
            materialization: materialization.to_string(),
            adapter: adapter.to_string(),
        })?;

    let winners: Vec<&'m (usize, Locality, &'a Macro)> =
        pool.iter().copied().filter(|c| key(*c) == best_key).collect();
    if winners.len() > 1 {
        let mut packages: Vec<String> = winners.iter().map(|(_, _, m)| m.package_name.clone()).collect();
        packages.sort();
        return Err(MacroError::DuplicateMaterialization {
            name: materialization.to_string(),
            packages,
        });
    }
    Ok(winners[0])
}
