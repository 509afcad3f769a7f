//! # Adjustment Profiles
//!
//! A profile is a named bundle of compensation terms plus a static offset
//! that applies only when its filters match the current run (material,
//! build surface, nozzle, probe type). Typical use: PETG on textured PEI
//! wants a little more squish than PLA on smooth PEI.
//!
//! ## Selection
//!
//! Profiles are chosen in two stages:
//! 1. Names the caller asked for (or the configured default list when the
//!    caller asked for none), deduplicated, in request order
//! 2. With auto-match on, every enabled profile whose filters match, in
//!    ascending `(priority, name)` order, skipping names already chosen
//!
//! Asking for a profile that does not exist is an error; asking for a
//! disabled one is not, it simply does not apply.

use crate::compensation::{
    BreakdownEntry, CompensationModel, CompensationSet, Quantity, References, TermKind,
};
use crate::config::{ProbeType, ProfileConfig};
use crate::error::ZOffsetError;
use crate::{normalize_token, EnvironmentSnapshot};
use serde::Serialize;
use std::collections::BTreeMap;

/// Match filters. Empty string means "any".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProfileFilters {
    pub material: String,
    pub surface: String,
    pub nozzle: String,
    pub probe_type: String,
}

/// One named adjustment profile.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdjustmentProfile {
    /// Normalised (lowercase) unique name
    pub name: String,
    pub priority: i32,
    pub enabled: bool,
    pub filters: ProfileFilters,
    /// Static offset and terms; term references are profile-local
    pub compensation: CompensationSet,
}

fn filter_token(value: &Option<String>) -> String {
    value.as_deref().map(normalize_token).unwrap_or_default()
}

fn profile_term(
    quantity: Quantity,
    coeff: Option<f64>,
    poly: &[f64],
    reference: Option<f64>,
) -> Option<CompensationModel> {
    TermKind::from_config(coeff.unwrap_or(0.0), poly).map(|kind| CompensationModel {
        quantity,
        kind,
        reference,
    })
}

impl AdjustmentProfile {
    /// Build a profile from its config table.
    pub fn from_config(name: &str, config: &ProfileConfig) -> Result<Self, ZOffsetError> {
        let name = normalize_token(name);
        if name.is_empty() {
            return Err(ZOffsetError::InvalidConfig(
                "adjustment profiles need a non-empty name".into(),
            ));
        }
        let probe_type = filter_token(&config.probe_type);
        if !probe_type.is_empty() {
            // Reject typos early; a filter that can never match is a silent no-op.
            probe_type.parse::<ProbeType>()?;
        }

        let terms = [
            profile_term(
                Quantity::BedTemp,
                config.bed_temp_coeff,
                &config.bed_temp_poly,
                config.bed_temp_reference,
            ),
            profile_term(
                Quantity::HotendTemp,
                config.hotend_temp_coeff,
                &config.hotend_temp_poly,
                config.hotend_temp_reference,
            ),
            profile_term(
                Quantity::ChamberTemp,
                config.chamber_temp_coeff,
                &config.chamber_temp_poly,
                config.chamber_temp_reference,
            ),
            profile_term(
                Quantity::FirstLayer,
                config.first_layer_coeff,
                &[],
                config.first_layer_reference,
            ),
        ]
        .into_iter()
        .flatten()
        .collect();

        Ok(Self {
            name,
            priority: config.priority.unwrap_or(100),
            enabled: config.enabled.unwrap_or(true),
            filters: ProfileFilters {
                material: filter_token(&config.material),
                surface: filter_token(&config.build_surface),
                nozzle: filter_token(&config.nozzle),
                probe_type,
            },
            compensation: CompensationSet {
                offset: config.offset.unwrap_or(0.0),
                terms,
            },
        })
    }

    /// Every non-empty filter must equal its input (case-insensitive).
    pub fn matches(&self, material: &str, surface: &str, nozzle: &str, probe_type: &str) -> bool {
        let check = |filter: &str, value: &str| filter.is_empty() || filter == normalize_token(value);
        check(&self.filters.probe_type, probe_type)
            && check(&self.filters.material, material)
            && check(&self.filters.surface, surface)
            && check(&self.filters.nozzle, nozzle)
    }

    /// Static offset plus every term, resolving references profile-local →
    /// global → calibration-time.
    pub fn calculate(
        &self,
        env: &EnvironmentSnapshot,
        calibration_refs: &References,
        global_refs: &References,
    ) -> (f64, Vec<BreakdownEntry>) {
        self.compensation
            .calculate(env, &[global_refs, calibration_refs], "", "offset", "")
    }
}

/// All configured profiles, keyed by normalised name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileSet {
    profiles: BTreeMap<String, AdjustmentProfile>,
}

impl ProfileSet {
    /// Build from config tables. Names differing only in case collide.
    pub fn from_configs(configs: &BTreeMap<String, ProfileConfig>) -> Result<Self, ZOffsetError> {
        let mut set = Self::default();
        for (name, config) in configs {
            set.insert(AdjustmentProfile::from_config(name, config)?)?;
        }
        Ok(set)
    }

    pub fn insert(&mut self, profile: AdjustmentProfile) -> Result<(), ZOffsetError> {
        if self.profiles.contains_key(&profile.name) {
            return Err(ZOffsetError::DuplicateProfileName(profile.name));
        }
        self.profiles.insert(profile.name.clone(), profile);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&AdjustmentProfile> {
        self.profiles.get(&normalize_token(name))
    }

    /// Sorted profile names.
    pub fn names(&self) -> Vec<String> {
        self.profiles.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Resolve the ordered list of profiles that apply to this run.
    pub fn resolve(
        &self,
        requested: &[String],
        defaults: &[String],
        auto_match: bool,
        env: &EnvironmentSnapshot,
        probe_type: ProbeType,
    ) -> Result<Vec<&AdjustmentProfile>, ZOffsetError> {
        let mut names: Vec<String> = requested
            .iter()
            .map(|name| normalize_token(name))
            .filter(|name| !name.is_empty())
            .collect();
        if names.is_empty() {
            names.extend(defaults.iter().map(|name| normalize_token(name)));
        }

        if auto_match {
            let mut matched: Vec<&AdjustmentProfile> = self
                .profiles
                .values()
                .filter(|p| {
                    p.enabled
                        && p.matches(&env.material, &env.surface, &env.nozzle, probe_type.name())
                })
                .collect();
            matched.sort_by(|a, b| (a.priority, &a.name).cmp(&(b.priority, &b.name)));
            for profile in matched {
                if !names.contains(&profile.name) {
                    names.push(profile.name.clone());
                }
            }
        }

        let mut resolved: Vec<&AdjustmentProfile> = Vec::new();
        for name in names {
            if name.is_empty() || resolved.iter().any(|p| p.name == name) {
                continue;
            }
            let profile = self
                .profiles
                .get(&name)
                .ok_or_else(|| ZOffsetError::UnknownProfile {
                    name: name.clone(),
                    available: self.names(),
                })?;
            if profile.enabled {
                resolved.push(profile);
            }
        }
        Ok(resolved)
    }
}
