use serde::{Deserialize, Serialize};

/// A project pages are generated for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
}

/// A page template applied to every subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub id: String,
    pub name: String,
    /// Template body; absent or blank means tasks using it are skipped.
    #[serde(default)]
    pub content: Option<String>,
}

impl Variant {
    pub fn has_content(&self) -> bool {
        self.content.as_deref().is_some_and(|c| !c.trim().is_empty())
    }
}

/// Import document for seeding a task source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub subjects: Vec<Subject>,
    #[serde(default)]
    pub variants: Vec<Variant>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_content_detection() {
        let mut variant = Variant {
            id: "t1".into(),
            name: "Landing".into(),
            content: None,
        };
        assert!(!variant.has_content());

        variant.content = Some("   ".into());
        assert!(!variant.has_content());

        variant.content = Some("# {{title}}".into());
        assert!(variant.has_content());
    }

    #[test]
    fn test_catalog_parses_with_defaults() {
        let catalog: Catalog = serde_json::from_str(
            r#"{"subjects":[{"id":"p1","name":"Acme"}],"variants":[{"id":"t1","name":"Home"}]}"#,
        )
        .unwrap();

        assert_eq!(catalog.subjects[0].category, None);
        assert!(!catalog.variants[0].has_content());
    }
}
