//! LD-004: Naming rules — canonical target names, the "managed collection"
//! predicate, and parsing of legacy two-level seasonal names.

use crate::core::types::{
    Classification, ClassificationSource, DishType, NamingScheme, RemoteCollection, RulesConfig,
    Season, SEASONAL_NAME_PATTERN,
};
use regex::Regex;
use std::collections::BTreeMap;

/// Compiled naming rules.
#[derive(Debug, Clone)]
pub struct NamingRules {
    scheme: NamingScheme,
    managed_patterns: Vec<Regex>,
    seasonal: Regex,
    translations: BTreeMap<DishType, String>,
    managed_origin: Option<String>,
}

impl Default for NamingRules {
    fn default() -> Self {
        // The built-in patterns are constant and known to compile.
        match Self::from_config(&RulesConfig::default()) {
            Ok(rules) => rules,
            Err(e) => unreachable!("default naming rules: {}", e),
        }
    }
}

impl NamingRules {
    pub fn from_config(config: &RulesConfig) -> Result<Self, String> {
        let mut managed_patterns = Vec::with_capacity(config.managed_patterns.len());
        for p in &config.managed_patterns {
            let re = Regex::new(p).map_err(|e| format!("invalid managed pattern '{}': {}", p, e))?;
            managed_patterns.push(re);
        }
        let seasonal = Regex::new(SEASONAL_NAME_PATTERN)
            .map_err(|e| format!("invalid seasonal pattern: {}", e))?;
        Ok(Self {
            scheme: config.naming,
            managed_patterns,
            seasonal,
            translations: config
                .translations
                .iter()
                .map(|(k, v)| (*k, v.clone()))
                .collect(),
            managed_origin: config.managed_origin_collection.clone(),
        })
    }

    /// Name of the export collection holding auto-suggested recipes.
    pub fn managed_origin(&self) -> Option<&str> {
        self.managed_origin.as_deref()
    }

    /// The managed-origin collection is never rewritten. Exporters label it
    /// `"[Managed] <name>"`; the platform lists it as `"<name>"`.
    pub fn is_protected(&self, collection_name: &str) -> bool {
        let Some(origin) = self.managed_origin.as_deref() else {
            return false;
        };
        collection_name == origin
            || origin
                .strip_prefix("[Managed] ")
                .is_some_and(|bare| bare == collection_name)
    }

    /// Flat collection name for a dish type (configured override or English).
    pub fn flat_name(&self, dish: DishType) -> String {
        self.translations
            .get(&dish)
            .cloned()
            .unwrap_or_else(|| dish.english().to_string())
    }

    /// Two-level name, e.g. `"☀️ Verano > Pescados"`.
    pub fn seasonal_name(&self, season: Season, dish: DishType) -> Option<String> {
        if season == Season::Unclassified {
            return None;
        }
        Some(format!("{} {} > {}", season.emoji(), season.label(), dish.label()))
    }

    /// Canonical target collection for a classification. `None` means the
    /// recipe has no target and keeps its existing memberships.
    pub fn target_name(&self, classification: &Classification) -> Option<String> {
        let dish = classification.dish_type?;
        match self.scheme {
            NamingScheme::Flat => Some(self.flat_name(dish)),
            NamingScheme::Seasonal => self.seasonal_name(classification.season, dish),
        }
    }

    /// A managed collection is one the organizer is allowed to rewrite.
    pub fn is_managed(&self, collection: &RemoteCollection) -> bool {
        collection.managed || self.matches_managed_pattern(&collection.name)
    }

    pub fn matches_managed_pattern(&self, name: &str) -> bool {
        self.managed_patterns.iter().any(|re| re.is_match(name))
    }

    /// Parse `"<emoji> <Season> > <DishType>"` (emoji optional).
    pub fn parse_two_level(&self, name: &str) -> Option<(Season, DishType)> {
        let caps = self.seasonal.captures(name)?;
        let season = Season::from_label(caps.get(1)?.as_str())?;
        let dish = DishType::from_label(caps.get(2)?.as_str())?;
        Some((season, dish))
    }

    /// Classification implied by a recipe's two-level collection names. When a
    /// recipe sits in several, the lexicographically first name wins.
    pub fn classification_from_names<'a, I>(&self, recipe_id: &str, names: I) -> Option<Classification>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut names: Vec<&str> = names.into_iter().collect();
        names.sort_unstable();
        names.into_iter().find_map(|name| {
            self.parse_two_level(name).map(|(season, dish)| Classification {
                recipe_id: recipe_id.to_string(),
                season,
                dish_type: Some(dish),
                confidence: 1.0,
                source: ClassificationSource::CollectionName,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn collection(name: &str, managed: bool) -> RemoteCollection {
        RemoteCollection {
            id: "c1".to_string(),
            name: name.to_string(),
            managed,
            members: BTreeSet::new(),
        }
    }

    fn classified(season: Season, dish: DishType) -> Classification {
        Classification {
            recipe_id: "r1".to_string(),
            season,
            dish_type: Some(dish),
            confidence: 0.9,
            source: ClassificationSource::Model,
        }
    }

    #[test]
    fn test_ld004_flat_target() {
        let rules = NamingRules::default();
        let c = classified(Season::Summer, DishType::Pescados);
        assert_eq!(rules.target_name(&c).as_deref(), Some("Seafood"));
    }

    #[test]
    fn test_ld004_flat_target_ignores_unknown_season() {
        let rules = NamingRules::default();
        let c = classified(Season::Unclassified, DishType::Postres);
        assert_eq!(rules.target_name(&c).as_deref(), Some("Desserts"));
    }

    #[test]
    fn test_ld004_unclassified_has_no_target() {
        let rules = NamingRules::default();
        assert_eq!(rules.target_name(&Classification::unclassified("r1")), None);
    }

    #[test]
    fn test_ld004_seasonal_target() {
        let config = RulesConfig {
            naming: NamingScheme::Seasonal,
            ..RulesConfig::default()
        };
        let rules = NamingRules::from_config(&config).unwrap();
        let c = classified(Season::Summer, DishType::Pescados);
        assert_eq!(
            rules.target_name(&c).as_deref(),
            Some("\u{2600}\u{FE0F} Verano > Pescados")
        );
        let no_season = classified(Season::Unclassified, DishType::Pescados);
        assert_eq!(rules.target_name(&no_season), None);
    }

    #[test]
    fn test_ld004_translation_override() {
        let mut config = RulesConfig::default();
        config
            .translations
            .insert(DishType::Pescados, "Fish".to_string());
        let rules = NamingRules::from_config(&config).unwrap();
        assert_eq!(rules.flat_name(DishType::Pescados), "Fish");
        assert_eq!(rules.flat_name(DishType::Sopas), "Soups");
    }

    #[test]
    fn test_ld004_parse_two_level() {
        let rules = NamingRules::default();
        assert_eq!(
            rules.parse_two_level("\u{2600}\u{FE0F} Verano > Pescados"),
            Some((Season::Summer, DishType::Pescados))
        );
        assert_eq!(
            rules.parse_two_level("Invierno > Sopas"),
            Some((Season::Winter, DishType::Sopas))
        );
        assert_eq!(
            rules.parse_two_level("\u{1F342} Otoño > Arroces"),
            Some((Season::Autumn, DishType::Arroces))
        );
        assert_eq!(rules.parse_two_level("Verano > Tapas"), None);
        assert_eq!(rules.parse_two_level("Seafood"), None);
    }

    #[test]
    fn test_ld004_managed_predicate() {
        let rules = NamingRules::default();
        assert!(rules.is_managed(&collection("Verano > Pescados", false)));
        assert!(rules.is_managed(&collection("Weekly picks", true)));
        assert!(!rules.is_managed(&collection("Cenas rápidas", false)));
        assert!(!rules.is_managed(&collection("Seafood", false)));
    }

    #[test]
    fn test_ld004_protected_origin() {
        let rules = NamingRules::default();
        assert!(rules.is_protected("[Managed] Ideas sencillas"));
        assert!(rules.is_protected("Ideas sencillas"));
        assert!(!rules.is_protected("Cenas"));

        let none = NamingRules::from_config(&RulesConfig {
            managed_origin_collection: None,
            ..RulesConfig::default()
        })
        .unwrap();
        assert!(!none.is_protected("Ideas sencillas"));
    }

    #[test]
    fn test_ld004_bad_pattern_rejected() {
        let config = RulesConfig {
            managed_patterns: vec!["(".to_string()],
            ..RulesConfig::default()
        };
        let err = NamingRules::from_config(&config).unwrap_err();
        assert!(err.contains("invalid managed pattern"));
    }

    #[test]
    fn test_ld004_classification_from_names_first_wins() {
        let rules = NamingRules::default();
        let c = rules
            .classification_from_names("r1", ["Verano > Pescados", "Invierno > Sopas", "Cenas"])
            .unwrap();
        assert_eq!(c.season, Season::Winter);
        assert_eq!(c.dish_type, Some(DishType::Sopas));
        assert_eq!(c.source, ClassificationSource::CollectionName);
        assert!(rules.classification_from_names("r2", ["Cenas"]).is_none());
    }
}
