//! Offline keyword classifier. Matches Spanish and English cooking terms in
//! the recipe name first, then in the ingredient text.

use super::{ClassificationService, RawLabels};
use crate::core::error::ServiceError;
use crate::core::types::{DishType, Season};
use async_trait::async_trait;

const INGREDIENTS_MARKER: &str = " (ingredients:";

const DISH_KEYWORDS: &[(DishType, &[&str])] = &[
    (
        DishType::Sopas,
        &["crema", "sopa", "caldo", "gazpacho", "salmorejo", "soup", "broth"],
    ),
    (DishType::Ensaladas, &["ensalada", "salad"]),
    (
        DishType::Pescados,
        &[
            "pescado", "merluza", "bacalao", "salmón", "salmon", "atún", "atun", "dorada",
            "lubina", "gambas", "langostinos", "mejillones", "calamar", "pulpo", "fish",
            "seafood", "prawn", "shrimp",
        ],
    ),
    (
        DishType::Carnes,
        &[
            "pollo", "cerdo", "ternera", "cordero", "carne", "albóndigas", "albondigas",
            "chicken", "pork", "beef", "lamb", "meat",
        ],
    ),
    (
        DishType::Pastas,
        &["pasta", "espagueti", "macarrones", "lasaña", "lasana", "noodles", "fideos", "spaghetti"],
    ),
    (DishType::Arroces, &["arroz", "risotto", "paella", "rice"]),
    (
        DishType::Postres,
        &[
            "bizcocho", "tarta", "helado", "flan", "natillas", "galletas", "mousse", "cake",
            "dessert", "cookie",
        ],
    ),
    (
        DishType::Panes,
        &["pan", "masa", "empanada", "focaccia", "brioche", "bread", "dough"],
    ),
    (
        DishType::Salsas,
        &["salsa", "alioli", "mayonesa", "pesto", "sofrito", "sauce"],
    ),
];

const SEASON_KEYWORDS: &[(Season, &[&str])] = &[
    (
        Season::Spring,
        &["espárragos", "esparragos", "guisantes", "alcachofas", "habas", "fresas", "asparagus", "peas"],
    ),
    (
        Season::Summer,
        &["gazpacho", "salmorejo", "tomate", "pimiento", "calabacín", "calabacin", "sandía", "melón", "ensalada", "salad"],
    ),
    (
        Season::Autumn,
        &["setas", "calabaza", "legumbres", "castañas", "castanas", "boniato", "mushroom", "pumpkin"],
    ),
    (
        Season::Winter,
        &["cocido", "guiso", "estofado", "potaje", "lentejas", "garbanzos", "stew"],
    ),
];

/// Earliest whole-word keyword hit in `text`; returns (position, label).
fn earliest<T: Copy>(table: &[(T, &[&str])], text: &str) -> Option<(usize, T)> {
    let mut best: Option<(usize, T)> = None;
    for (label, words) in table {
        for word in *words {
            if let Some(pos) = find_word(text, word) {
                if best.is_none_or(|(b, _)| pos < b) {
                    best = Some((pos, *label));
                }
            }
        }
    }
    best
}

/// Position of `word` in `text` at a word start ("pan" matches "pan de
/// molino" and "panecillos", not "empanada").
fn find_word(text: &str, word: &str) -> Option<usize> {
    text.match_indices(word).map(|(i, _)| i).find(|&i| {
        text[..i]
            .chars()
            .next_back()
            .is_none_or(|c| !c.is_alphanumeric())
    })
}

/// Keyword-table classifier.
#[derive(Debug, Clone, Default)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    pub fn new() -> Self {
        Self
    }

    fn labels(&self, text: &str) -> Option<RawLabels> {
        let lower = text.to_lowercase();
        let (name, ingredients) = match lower.find(INGREDIENTS_MARKER) {
            Some(i) => (&lower[..i], &lower[i..]),
            None => (lower.as_str(), ""),
        };

        let (dish, confidence) = match earliest(DISH_KEYWORDS, name) {
            Some((_, d)) => (d, 0.7),
            None => (earliest(DISH_KEYWORDS, ingredients)?.1, 0.4),
        };
        let season = earliest(SEASON_KEYWORDS, name)
            .or_else(|| earliest(SEASON_KEYWORDS, ingredients))
            .map(|(_, s)| s)
            .unwrap_or(Season::Unclassified);

        Some(RawLabels {
            season: season.label().to_string(),
            dish_type: dish.label().to_string(),
            confidence: Some(confidence),
        })
    }
}

#[async_trait]
impl ClassificationService for KeywordClassifier {
    async fn classify(&self, text: &str) -> Result<RawLabels, ServiceError> {
        self.labels(text).ok_or_else(|| {
            ServiceError::Malformed(format!("no dish-type keyword in \"{}\"", text))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(text: &str) -> Option<RawLabels> {
        KeywordClassifier::new().labels(text)
    }

    #[test]
    fn test_ld031_name_keywords() {
        let l = classify("Gazpacho andaluz").unwrap();
        assert_eq!(l.dish_type, "Sopas");
        assert_eq!(l.season, "Verano");

        let l = classify("Crema de calabaza").unwrap();
        assert_eq!(l.dish_type, "Sopas");
        assert_eq!(l.season, "Otoño");
    }

    #[test]
    fn test_ld031_earliest_keyword_wins() {
        let l = classify("Ensalada de pasta").unwrap();
        assert_eq!(l.dish_type, "Ensaladas");
        let l = classify("Pasta con salsa de tomate").unwrap();
        assert_eq!(l.dish_type, "Pastas");
    }

    #[test]
    fn test_ld031_word_start_only() {
        let l = classify("Empanada gallega").unwrap();
        assert_eq!(l.dish_type, "Panes");
        assert!(find_word("empanada", "pan").is_none());
        assert_eq!(find_word("pan de ajo", "pan"), Some(0));
    }

    #[test]
    fn test_ld031_falls_back_to_ingredients() {
        let l = classify("Receta de la abuela (ingredients: arroz, caldo de pescado)").unwrap();
        assert_eq!(l.dish_type, "Arroces");
        assert_eq!(l.confidence, Some(0.4));
        assert_eq!(l.season, "unclassified");
    }

    #[tokio::test]
    async fn test_ld031_no_keyword_is_malformed() {
        let err = KeywordClassifier::new().classify("Cosa rara").await.unwrap_err();
        assert!(matches!(err, ServiceError::Malformed(_)));
    }
}
