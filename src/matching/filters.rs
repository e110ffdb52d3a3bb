use crate::store::{AllowedSize, Company, Incentive};
use std::collections::BTreeMap;

pub const DEFAULT_SIZE_PENALTY: f64 = 0.8;
pub const DEFAULT_SECTOR_PENALTY: f64 = 0.7;
pub const DEFAULT_REGION_PENALTY: f64 = 0.9;

/// Scope tokens that mark an incentive as country-wide.
const COUNTRY_WIDE_TOKENS: &[&str] = &["portugal", "nacional", "todo o país", "todas as regiões"];

/// Static regional aliases: a region named in the scope admits the listed
/// districts. Extensions go through [`PenaltyConfig::region_aliases`].
const DEFAULT_REGION_ALIASES: &[(&str, &[&str])] = &[
    ("algarve", &["faro"]),
    ("centro", &["coimbra", "leiria", "aveiro"]),
    ("norte", &["porto", "braga", "vila real"]),
    ("lisboa", &["lisboa", "setúbal"]),
];

/// Multiplicative penalty factors for categorical mismatches.
#[derive(Debug, Clone)]
pub struct PenaltyConfig {
    pub size_mismatch: f64,
    pub sector_mismatch: f64,
    pub region_mismatch: f64,
    pub region_aliases: Vec<(String, Vec<String>)>,
}

impl Default for PenaltyConfig {
    fn default() -> Self {
        Self {
            size_mismatch: DEFAULT_SIZE_PENALTY,
            sector_mismatch: DEFAULT_SECTOR_PENALTY,
            region_mismatch: DEFAULT_REGION_PENALTY,
            region_aliases: DEFAULT_REGION_ALIASES
                .iter()
                .map(|(region, districts)| {
                    (
                        (*region).to_string(),
                        districts.iter().map(|d| (*d).to_string()).collect(),
                    )
                })
                .collect(),
        }
    }
}

/// Apply the deterministic mismatch rules, each firing at most once.
///
/// Returns the product of the fired penalties (1.0 when none fired) and a
/// map of which rules fired with their factors.
pub fn deterministic_penalty(
    incentive: &Incentive,
    company: &Company,
    config: &PenaltyConfig,
) -> (f64, BTreeMap<&'static str, f64>) {
    let mut penalty = 1.0;
    let mut fired = BTreeMap::new();

    let Some(profile) = &incentive.profile else {
        return (penalty, fired);
    };

    // Size rule: skipped entirely when the incentive declares the size
    // dimension as not applicable.
    let sizes = &profile.company_sizes;
    if !sizes.is_empty()
        && !sizes.contains(&AllowedSize::NotApplicable)
        && !sizes.iter().any(|s| s.admits(company.size))
    {
        penalty *= config.size_mismatch;
        fired.insert("size", config.size_mismatch);
    }

    // Sector rule: fires only when both sides declare codes and they share none.
    if !profile.sector_codes.is_empty()
        && !company.sector_codes.is_empty()
        && !profile
            .sector_codes
            .iter()
            .any(|code| company.sector_codes.contains(code))
    {
        penalty *= config.sector_mismatch;
        fired.insert("sector", config.sector_mismatch);
    }

    // Region rule: the company district must appear in the scope, or the
    // scope must be country-wide or cover the district via an alias.
    if let (Some(scope), Some(district)) = (&profile.geographic_scope, &company.district) {
        let scope = scope.to_lowercase();
        let district = district.to_lowercase();
        if !scope.trim().is_empty() && !region_matches(&scope, &district, &config.region_aliases) {
            penalty *= config.region_mismatch;
            fired.insert("region", config.region_mismatch);
        }
    }

    (penalty, fired)
}

fn region_matches(scope: &str, district: &str, aliases: &[(String, Vec<String>)]) -> bool {
    if scope.contains(district) {
        return true;
    }
    if COUNTRY_WIDE_TOKENS.iter().any(|token| scope.contains(token)) {
        return true;
    }
    aliases.iter().any(|(region, districts)| {
        scope.contains(region.as_str()) && districts.iter().any(|d| d == district)
    })
}
