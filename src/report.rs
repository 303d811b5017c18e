//! Report types produced by the pipeline. Field names follow the JSON the
//! report renderer and upload endpoint consume (camelCase).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderCheck {
    pub title: String,
    pub passed: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
}

impl HeaderCheck {
    pub fn pass(title: impl Into<String>, message: impl Into<String>) -> Self {
        HeaderCheck {
            title: title.into(),
            passed: true,
            message: message.into(),
            severity: None,
        }
    }

    pub fn fail(title: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        HeaderCheck {
            title: title.into(),
            passed: false,
            message: message.into(),
            severity: Some(severity),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeaderAnalysis {
    pub checks: Vec<HeaderCheck>,
}

/// A link check carries either a plain message or nested sub-checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LinkMessage {
    Text(String),
    Nested(Vec<LinkCheck>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkCheck {
    pub title: String,
    pub passed: bool,
    pub message: LinkMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkAnalysis {
    pub checks: Vec<LinkCheck>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trustworthiness {
    Suspicious,
    Neutral,
    Trustworthy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Threat {
    pub title: String,
    pub severity: Severity,
    pub description: String,
}

/// The classifier's verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiAnalysis {
    pub title: String,
    pub trustworthiness: Trustworthiness,
    pub trust_points: f64,
    #[serde(default)]
    pub threats: Vec<Threat>,
    pub explanation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_address: Option<String>,
}

impl AiAnalysis {
    pub fn unavailable(reason: &str) -> Self {
        AiAnalysis {
            title: "Message could not be analyzed".to_string(),
            trustworthiness: Trustworthiness::Neutral,
            trust_points: 2.5,
            threats: Vec::new(),
            explanation: reason.to_string(),
            sender_name: None,
            sender_address: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplanationTerm {
    pub term: String,
    pub path: String,
}

/// Glossary terms the classifier may reference as `[[Term]]`, with the path
/// of their explanation page.
pub const EXPLANATION_TERMS: [(&str, &str); 13] = [
    ("DKIM", "/explain/dkim"),
    ("SPF", "/explain/spf"),
    ("Return-Path", "/explain/return-path"),
    ("Domain", "/explain/domain"),
    ("Blacklist", "/explain/blacklist"),
    ("Redirect", "/explain/redirect"),
    ("EML file", "/explain/eml-file"),
    ("Phishing", "/explain/phishing"),
    ("Spoofing", "/explain/spoofing"),
    ("DMARC", "/explain/dmarc"),
    ("Header", "/explain/header"),
    ("MIME", "/explain/mime"),
    ("Attachment", "/explain/attachment"),
];

pub fn explanation_terms() -> Vec<ExplanationTerm> {
    EXPLANATION_TERMS
        .iter()
        .map(|(term, path)| ExplanationTerm {
            term: term.to_string(),
            path: path.to_string(),
        })
        .collect()
}

pub fn explanation_path(term: &str) -> Option<&'static str> {
    EXPLANATION_TERMS
        .iter()
        .find(|(t, _)| t.eq_ignore_ascii_case(term))
        .map(|(_, path)| *path)
}

/// Score ceiling for a full analysis (original headers available).
pub const MAX_SCORE_FULL: u32 = 10;
/// Score ceiling when only the forwarded body could be analyzed.
pub const MAX_SCORE_REDUCED: u32 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub sender_name: String,
    pub sender_email: String,
    pub subject: String,
    pub max_score: u32,
    pub total_score: f64,
    pub ai_analysis: AiAnalysis,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header_analysis: Option<HeaderAnalysis>,
    pub link_analysis: LinkAnalysis,
    pub explanation_terms: Vec<ExplanationTerm>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_link_message_serializes_untagged() {
        let check = LinkCheck {
            title: "Checking https://a.example/".to_string(),
            passed: false,
            message: LinkMessage::Nested(vec![LinkCheck {
                title: "Found: https://b.example/".to_string(),
                passed: false,
                message: LinkMessage::Text("Google Safe Browsing".to_string()),
                screenshot: None,
            }]),
            screenshot: Some("abc.png".to_string()),
        };
        let value = serde_json::to_value(&check).unwrap();
        assert_eq!(value["message"][0]["message"], json!("Google Safe Browsing"));
        assert_eq!(value["screenshot"], json!("abc.png"));
        assert!(value["message"][0].get("screenshot").is_none());
    }

    #[test]
    fn test_ai_analysis_accepts_camel_case() {
        let raw = json!({
            "title": "Suspicious sender",
            "trustworthiness": "suspicious",
            "trustPoints": 1.5,
            "threats": [{"title": "Sender", "severity": "high", "description": "Mismatch"}],
            "explanation": "..."
        });
        let parsed: AiAnalysis = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.trustworthiness, Trustworthiness::Suspicious);
        assert_eq!(parsed.threats[0].severity, Severity::High);
        assert!(parsed.sender_name.is_none());
    }

    #[test]
    fn test_explanation_lookup() {
        assert_eq!(explanation_path("spf"), Some("/explain/spf"));
        assert_eq!(explanation_path("nope"), None);
        assert_eq!(explanation_terms().len(), EXPLANATION_TERMS.len());
    }
}
