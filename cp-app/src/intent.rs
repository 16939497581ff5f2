use crate::config::{DEFAULT_INTENT, IntentConfig};

/// Maps merged turn text to an intent key.
pub trait IntentClassifier: Send + Sync {
    fn classify(&self, text: &str) -> String;
}

/// First configured intent with a keyword contained in the text wins.
#[derive(Debug, Clone, Default)]
pub struct KeywordIntentClassifier {
    intents: Vec<(String, Vec<String>)>,
}

impl KeywordIntentClassifier {
    pub fn new(intents: &[IntentConfig]) -> Self {
        let intents = intents
            .iter()
            .map(|intent| {
                let keywords = intent
                    .keywords
                    .iter()
                    .map(|k| k.trim().to_lowercase())
                    .filter(|k| !k.is_empty())
                    .collect();
                (intent.key.trim().to_string(), keywords)
            })
            .collect();
        Self { intents }
    }
}

impl IntentClassifier for KeywordIntentClassifier {
    fn classify(&self, text: &str) -> String {
        let lowered = text.to_lowercase();
        self.intents
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|k| lowered.contains(k.as_str())))
            .map(|(key, _)| key.clone())
            .unwrap_or_else(|| DEFAULT_INTENT.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent(key: &str, keywords: &[&str]) -> IntentConfig {
        IntentConfig {
            key: key.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }

    #[test]
    fn first_matching_intent_wins() {
        let classifier = KeywordIntentClassifier::new(&[
            intent("astro", &["星座", "Zodiac"]),
            intent("weather", &["天气", "zodiac"]),
        ]);
        assert_eq!(classifier.classify("what's my ZODIAC today"), "astro");
        assert_eq!(classifier.classify("明天天气怎么样"), "weather");
    }

    #[test]
    fn unmatched_text_maps_to_default_intent() {
        let classifier = KeywordIntentClassifier::new(&[intent("astro", &["星座"])]);
        let key = classifier.classify("hello there");
        assert_eq!(key, DEFAULT_INTENT);
        assert_eq!(KeywordIntentClassifier::default().classify("星座"), DEFAULT_INTENT);
    }
}
