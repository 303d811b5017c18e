//! Raw message parsing into an immutable [`ParsedEmail`], plus the header and
//! body views the authentication and link checks work from.

use lazy_static::lazy_static;
use mail_parser::{MessageParser, MimeHeaders, PartType};
use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::net::Ipv4Addr;

lazy_static! {
    static ref BRACKETED_IPV4: Regex =
        Regex::new(r"\[(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})\]").unwrap();
    static ref HELO_HOP: Regex =
        Regex::new(r"from\s+(\S+)\s+\(.*\[(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})\]").unwrap();
    static ref BODY_URL: Regex = Regex::new(r"https?://[^\s]+").unwrap();
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
    static ref ANCHOR: Selector = Selector::parse("a[href]").unwrap();
    static ref BODY: Selector = Selector::parse("body").unwrap();
}

const REQUIRED_HEADERS: [&str; 3] = ["from", "date", "message-id"];
const KEPT_ATTRIBUTES: [&str; 5] = ["href", "target", "rel", "title", "alt"];
const VOID_ELEMENTS: [&str; 8] = ["br", "hr", "img", "input", "meta", "link", "area", "wbr"];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("message could not be parsed as MIME")]
    Malformed,
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),
    #[error("message has no text or HTML content")]
    NoContent,
    #[error("From header has no address")]
    NoSender,
}

#[derive(Debug, Clone)]
pub struct Attachment {
    pub file_name: String,
    pub content_type: String,
    pub content: Vec<u8>,
    /// SHA-256 hex of `content`.
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anchor {
    pub text: String,
    pub url: String,
}

/// Received chain with our own hops removed, and what it says about the
/// server that handed the message to us.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTrace {
    pub hops: Vec<String>,
    pub sender_ip: Option<Ipv4Addr>,
    pub helo: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ParsedEmail {
    raw: Vec<u8>,
    headers: Vec<(String, String)>,
    sender_address: String,
    sender_name: String,
    subject: String,
    reply_to: Option<String>,
    return_path: Option<String>,
    text: Option<String>,
    html: Option<String>,
    attachments: Vec<Attachment>,
    nested_raw: Vec<Vec<u8>>,
}

/// Unfold the header block into `(lowercase name, value)` pairs in order.
fn parse_header_block(raw: &[u8]) -> Vec<(String, String)> {
    let text = String::from_utf8_lossy(raw);
    let mut headers: Vec<(String, String)> = Vec::new();

    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.trim().is_empty() {
            break;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_lowercase(), value.trim().to_string()));
        }
    }
    headers
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn escape_attr(s: &str) -> String {
    s.replace('&', "&amp;").replace('"', "&quot;")
}

fn write_stripped(el: ElementRef<'_>, out: &mut String) {
    let name = el.value().name();
    out.push('<');
    out.push_str(name);
    for (attr, value) in el.value().attrs() {
        if KEPT_ATTRIBUTES.contains(&attr) {
            out.push_str(&format!(" {attr}=\"{}\"", escape_attr(value)));
        }
    }
    out.push('>');
    if VOID_ELEMENTS.contains(&name) {
        return;
    }
    write_children(el, out);
    out.push_str(&format!("</{name}>"));
}

fn write_children(el: ElementRef<'_>, out: &mut String) {
    for child in el.children() {
        if let Some(child_el) = ElementRef::wrap(child) {
            write_stripped(child_el, out);
        } else if let Node::Text(text) = child.value() {
            out.push_str(&escape_text(text));
        }
    }
}

impl ParsedEmail {
    /// Parse raw bytes. The message must carry From, Date and Message-Id
    /// headers and a non-empty text or HTML body.
    pub fn parse(raw: &[u8]) -> Result<ParsedEmail, ParseError> {
        let headers = parse_header_block(raw);
        for required in REQUIRED_HEADERS {
            if !headers.iter().any(|(name, _)| name == required) {
                return Err(ParseError::MissingHeader(required));
            }
        }

        let message = MessageParser::default()
            .parse(raw)
            .ok_or(ParseError::Malformed)?;

        let text = message
            .text_body
            .iter()
            .filter_map(|id| message.parts.get(*id as usize))
            .find_map(|part| match &part.body {
                PartType::Text(text) if !text.trim().is_empty() => Some(text.to_string()),
                _ => None,
            });
        let html = message
            .html_body
            .iter()
            .filter_map(|id| message.parts.get(*id as usize))
            .find_map(|part| match &part.body {
                PartType::Html(html) if !html.trim().is_empty() => Some(html.to_string()),
                _ => None,
            });
        if text.is_none() && html.is_none() {
            return Err(ParseError::NoContent);
        }

        let sender = message
            .from()
            .and_then(|from| from.first())
            .ok_or(ParseError::NoSender)?;
        let sender_address = sender
            .address()
            .map(str::to_string)
            .ok_or(ParseError::NoSender)?;
        let sender_name = sender.name().unwrap_or_default().to_string();

        let reply_to = message
            .reply_to()
            .and_then(|addr| addr.first())
            .and_then(|addr| addr.address())
            .map(str::to_string);

        let return_path = headers
            .iter()
            .find(|(name, _)| name == "return-path")
            .map(|(_, value)| value.trim_matches(|c| c == '<' || c == '>' || c == ' ').to_string())
            .filter(|value| !value.is_empty());

        let mut attachments = Vec::new();
        let mut nested_raw = Vec::new();
        for part in message.attachments() {
            let content_type = part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string());

            if let Some(inner) = part.message() {
                nested_raw.push(inner.raw_message().to_vec());
            }

            let content = part.contents().to_vec();
            attachments.push(Attachment {
                file_name: part.attachment_name().unwrap_or("unnamed").to_string(),
                checksum: sha256_hex(&content),
                content_type,
                content,
            });
        }

        Ok(ParsedEmail {
            raw: raw.to_vec(),
            headers,
            sender_address,
            sender_name,
            subject: message.subject().unwrap_or_default().to_string(),
            reply_to,
            return_path,
            text,
            html,
            attachments,
            nested_raw,
        })
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn sender_address(&self) -> &str {
        &self.sender_address
    }

    pub fn sender_name(&self) -> &str {
        &self.sender_name
    }

    pub fn sender_domain(&self) -> Option<&str> {
        self.sender_address.rsplit_once('@').map(|(_, d)| d)
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn return_path(&self) -> Option<&str> {
        self.return_path.as_deref()
    }

    /// First value of a header, by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        let name = name.to_lowercase();
        self.headers
            .iter()
            .filter(move |(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    pub fn html(&self) -> Option<&str> {
        self.html.as_deref()
    }

    /// Best available body: HTML first, then text.
    pub fn content(&self) -> &str {
        self.html
            .as_deref()
            .or(self.text.as_deref())
            .unwrap_or_default()
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    /// Received hops minus those added by `relay` or localhost, and the
    /// sending server's IP and HELO name taken from the remaining hops.
    pub fn routing_trace(&self, relay: &str) -> RoutingTrace {
        let own = format!("from {relay}");
        let hops: Vec<String> = self
            .header_values("received")
            .map(|hop| WHITESPACE.replace_all(hop.trim(), " ").into_owned())
            .filter(|hop| {
                !(hop.starts_with(&own) || hop.starts_with("from localhost") || hop.starts_with("by"))
            })
            .collect();

        let sender_ip = hops
            .iter()
            .find_map(|hop| BRACKETED_IPV4.captures(hop))
            .and_then(|caps| caps[1].parse().ok());
        let helo = hops
            .iter()
            .find_map(|hop| HELO_HOP.captures(hop))
            .map(|caps| caps[1].to_string());

        RoutingTrace {
            hops,
            sender_ip,
            helo,
        }
    }

    /// Messages attached as `message/*` parts, one level deep. Attachments
    /// that are not themselves valid messages are skipped.
    pub fn nested_messages(&self) -> Vec<ParsedEmail> {
        self.nested_raw
            .iter()
            .filter_map(|raw| match ParsedEmail::parse(raw) {
                Ok(email) => Some(email),
                Err(e) => {
                    log::debug!("Skipping nested message: {e}");
                    None
                }
            })
            .collect()
    }

    pub fn anchors(&self) -> Vec<Anchor> {
        let html = match &self.html {
            Some(html) => Html::parse_document(html),
            None => return Vec::new(),
        };
        html.select(&ANCHOR)
            .filter_map(|a| {
                let url = a.value().attr("href")?.trim();
                if url.is_empty() {
                    return None;
                }
                Some(Anchor {
                    text: a.text().collect::<String>().trim().to_string(),
                    url: url.to_string(),
                })
            })
            .collect()
    }

    /// Unique anchor targets followed by bare `http(s)://` URLs in the body.
    pub fn all_urls(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut urls = Vec::new();
        for anchor in self.anchors() {
            if seen.insert(anchor.url.clone()) {
                urls.push(anchor.url);
            }
        }
        let body = self.text.as_deref().or(self.html.as_deref()).unwrap_or_default();
        for found in BODY_URL.find_iter(body) {
            let url = found
                .as_str()
                .trim_end_matches(|c| matches!(c, '>' | ')' | ']' | '"' | '\'' | '.' | ',' | ';'));
            if seen.insert(url.to_string()) {
                urls.push(url.to_string());
            }
        }
        urls
    }

    /// Body HTML with comments dropped and only link and alt-text attributes
    /// kept, whitespace collapsed.
    pub fn stripped_html(&self) -> String {
        let html = match &self.html {
            Some(html) => Html::parse_document(html),
            None => return String::new(),
        };
        let mut out = String::new();
        if let Some(body) = html.select(&BODY).next() {
            write_children(body, &mut out);
        }
        WHITESPACE.replace_all(&out, " ").trim().to_string()
    }
}
