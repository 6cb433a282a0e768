//! Caption parsing for inbound save events.
//!
//! Extraction is deliberately infallible: when nothing in the caption is
//! recognizable we fall back to a default guess rather than failing the
//! event, so a save always lands somewhere the user can correct it.

/// A restaurant name and city pulled out of a caption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub name: String,
    pub city: String,
}

/// Keyword-driven caption parser.
///
/// Captions are matched against a fixed keyword table first, then against
/// a `"Name in City"` pattern, and finally resolved to a default. A real
/// parser would sit behind the same signature.
#[derive(Debug, Clone)]
pub struct Extractor {
    keywords: Vec<(&'static str, &'static str, &'static str)>,
    fallback: (&'static str, &'static str),
}

impl Default for Extractor {
    fn default() -> Self {
        Self {
            keywords: vec![("sushi", "Sushi Nakazawa", "Tokyo")],
            fallback: ("Joe's Pizza", "New York"),
        }
    }
}

impl Extractor {
    /// Derive a restaurant candidate from a caption. Never fails; the
    /// source URL is accepted for parity with richer extractors but the
    /// current rules only look at the caption text.
    pub fn extract(&self, raw_caption: Option<&str>, _source_url: &str) -> Extraction {
        let caption = raw_caption.unwrap_or("").trim();

        if !caption.is_empty() {
            let lowered = caption.to_lowercase();
            for (keyword, name, city) in &self.keywords {
                if lowered.contains(keyword) {
                    return Extraction {
                        name: (*name).to_owned(),
                        city: (*city).to_owned(),
                    };
                }
            }

            // "Dinner at Carbone in Manhattan" style captions. Split on the
            // last " in " so restaurant names containing "in" still parse.
            // Offsets found in `lowered` only line up with `caption` for
            // ASCII text; anything else takes the fallback.
            if let Some(index) = lowered.rfind(" in ").filter(|_| caption.is_ascii()) {
                let name = caption[..index].trim();
                let city = caption[index + 4..].trim();
                if !name.is_empty() && !city.is_empty() {
                    return Extraction {
                        name: strip_leading_filler(name).to_owned(),
                        city: city.trim_end_matches(['.', '!']).to_owned(),
                    };
                }
            }
        }

        Extraction {
            name: self.fallback.0.to_owned(),
            city: self.fallback.1.to_owned(),
        }
    }
}

/// Drop common caption openers like "Dinner at" before a restaurant name.
fn strip_leading_filler(name: &str) -> &str {
    let lowered = name.to_lowercase();
    match lowered.rfind(" at ") {
        Some(index) => name[index + 4..].trim(),
        None => name,
    }
}
