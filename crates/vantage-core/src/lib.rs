pub mod contracts;
pub mod stores;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

pub const ATTRIBUTION_FIELDS: [AttributionField; 5] = [
    AttributionField::UtmSource,
    AttributionField::UtmMedium,
    AttributionField::UtmCampaign,
    AttributionField::UtmTerm,
    AttributionField::UtmContent,
];

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AttributionField {
    UtmSource,
    UtmMedium,
    UtmCampaign,
    UtmTerm,
    UtmContent,
}

impl AttributionField {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttributionField::UtmSource => "utm_source",
            AttributionField::UtmMedium => "utm_medium",
            AttributionField::UtmCampaign => "utm_campaign",
            AttributionField::UtmTerm => "utm_term",
            AttributionField::UtmContent => "utm_content",
        }
    }
}

impl fmt::Display for AttributionField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttributionField {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "utm_source" | "source" => Ok(AttributionField::UtmSource),
            "utm_medium" | "medium" => Ok(AttributionField::UtmMedium),
            "utm_campaign" | "campaign" => Ok(AttributionField::UtmCampaign),
            "utm_term" | "term" => Ok(AttributionField::UtmTerm),
            "utm_content" | "content" => Ok(AttributionField::UtmContent),
            other => Err(format!("Unknown attribution field: {other}")),
        }
    }
}

/// Campaign parameters as seen on a URL or held in a first/last-touch snapshot.
///
/// Empty strings are treated the same as absent values everywhere: `get` never
/// returns `Some("")`, and `set` ignores empty input.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttributionParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_medium: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_campaign: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_term: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_content: Option<String>,
}

impl AttributionParameters {
    pub fn from_query_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut params = Self::default();
        for (key, value) in pairs {
            let Some(field) = ATTRIBUTION_FIELDS
                .iter()
                .find(|field| field.as_str() == key.as_ref())
            else {
                continue;
            };
            params.set(*field, value.as_ref());
        }
        params
    }

    /// Reads the campaign fields from a page URL. Unparseable URLs yield no parameters.
    pub fn from_url(page_url: &str) -> Self {
        match Url::parse(page_url) {
            Ok(url) => Self::from_query_pairs(url.query_pairs()),
            Err(_) => Self::default(),
        }
    }

    pub fn get(&self, field: AttributionField) -> Option<&str> {
        let value = match field {
            AttributionField::UtmSource => &self.utm_source,
            AttributionField::UtmMedium => &self.utm_medium,
            AttributionField::UtmCampaign => &self.utm_campaign,
            AttributionField::UtmTerm => &self.utm_term,
            AttributionField::UtmContent => &self.utm_content,
        };
        value.as_deref().filter(|value| !value.is_empty())
    }

    pub fn set(&mut self, field: AttributionField, value: &str) {
        if value.is_empty() {
            return;
        }
        let slot = match field {
            AttributionField::UtmSource => &mut self.utm_source,
            AttributionField::UtmMedium => &mut self.utm_medium,
            AttributionField::UtmCampaign => &mut self.utm_campaign,
            AttributionField::UtmTerm => &mut self.utm_term,
            AttributionField::UtmContent => &mut self.utm_content,
        };
        *slot = Some(value.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.present().next().is_none()
    }

    /// Non-empty fields in declaration order.
    pub fn present(&self) -> impl Iterator<Item = (AttributionField, &str)> + '_ {
        ATTRIBUTION_FIELDS
            .iter()
            .filter_map(move |field| self.get(*field).map(|value| (*field, value)))
    }

    /// Returns `self` with every non-empty field of `overlay` written on top.
    pub fn overlaid_with(&self, overlay: &AttributionParameters) -> AttributionParameters {
        let mut merged = self.clone();
        for (field, value) in overlay.present() {
            merged.set(field, value);
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_campaign_fields_from_url_and_ignores_others() {
        let params = AttributionParameters::from_url(
            "https://shop.example/landing?utm_source=newsletter&utm_medium=email&ref=abc&utm_term=",
        );
        assert_eq!(params.get(AttributionField::UtmSource), Some("newsletter"));
        assert_eq!(params.get(AttributionField::UtmMedium), Some("email"));
        assert_eq!(params.get(AttributionField::UtmTerm), None);
        assert_eq!(params.utm_term, None);
        assert_eq!(params.present().count(), 2);
    }

    #[test]
    fn unparseable_url_yields_empty_parameters() {
        assert!(AttributionParameters::from_url("not a url").is_empty());
    }

    #[test]
    fn overlay_keeps_base_fields_missing_from_overlay() {
        let base = AttributionParameters::from_query_pairs([
            ("utm_source", "google"),
            ("utm_campaign", "spring"),
        ]);
        let overlay = AttributionParameters::from_query_pairs([("utm_source", "newsletter")]);

        let merged = base.overlaid_with(&overlay);
        assert_eq!(merged.get(AttributionField::UtmSource), Some("newsletter"));
        assert_eq!(merged.get(AttributionField::UtmCampaign), Some("spring"));
    }

    #[test]
    fn field_names_parse_with_or_without_prefix() {
        assert_eq!(
            "utm_source".parse::<AttributionField>(),
            Ok(AttributionField::UtmSource)
        );
        assert_eq!(
            " Content ".parse::<AttributionField>(),
            Ok(AttributionField::UtmContent)
        );
        assert!("gclid".parse::<AttributionField>().is_err());
    }

    #[test]
    fn empty_string_values_are_treated_as_absent() {
        let params = AttributionParameters {
            utm_source: Some(String::new()),
            ..AttributionParameters::default()
        };
        assert!(params.is_empty());
        assert_eq!(params.get(AttributionField::UtmSource), None);
    }
}
