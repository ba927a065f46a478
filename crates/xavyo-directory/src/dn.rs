//! Distinguished name handling
//!
//! RFC 4514 parsing for member resolution and search-base comparison, and
//! RFC 4515/4514 escaping for values placed into filters and names.

use std::fmt;

use crate::error::{DirectoryError, DirectoryResult};

/// One attribute-value assertion of an RDN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ava {
    pub attribute: String,
    pub value: String,
}

/// A relative distinguished name (one or more `+`-joined assertions).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rdn {
    avas: Vec<Ava>,
}

impl Rdn {
    #[must_use]
    pub fn avas(&self) -> &[Ava] {
        &self.avas
    }

    /// Value for an attribute type, compared case-insensitively.
    #[must_use]
    pub fn value_of(&self, attribute: &str) -> Option<&str> {
        self.avas
            .iter()
            .find(|ava| ava.attribute.eq_ignore_ascii_case(attribute))
            .map(|ava| ava.value.as_str())
    }

    fn eq_ignore_case(&self, other: &Rdn) -> bool {
        self.avas.len() == other.avas.len()
            && self.avas.iter().all(|a| {
                other.avas.iter().any(|b| {
                    a.attribute.eq_ignore_ascii_case(&b.attribute)
                        && a.value.to_lowercase() == b.value.to_lowercase()
                })
            })
    }
}

/// A parsed distinguished name, leftmost RDN first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistinguishedName {
    rdns: Vec<Rdn>,
}

impl DistinguishedName {
    /// Parse a DN string.
    pub fn parse(dn: &str) -> DirectoryResult<Self> {
        let invalid = |message: &str| DirectoryError::InvalidName {
            dn: dn.to_string(),
            message: message.to_string(),
        };

        if dn.trim().is_empty() {
            return Ok(Self { rdns: Vec::new() });
        }

        let mut rdns = Vec::new();
        for rdn_str in split_unescaped(dn, &[',', ';']).map_err(|m| invalid(&m))? {
            let mut avas = Vec::new();
            for ava_str in split_unescaped(&rdn_str, &['+']).map_err(|m| invalid(&m))? {
                let eq = find_unescaped(&ava_str, '=')
                    .ok_or_else(|| invalid("attribute-value assertion without '='"))?;
                let attribute = ava_str[..eq].trim();
                if attribute.is_empty() {
                    return Err(invalid("empty attribute type"));
                }
                if !attribute
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
                {
                    return Err(invalid("malformed attribute type"));
                }
                let value = unescape_value(ava_str[eq + 1..].trim()).map_err(|m| invalid(&m))?;
                avas.push(Ava {
                    attribute: attribute.to_string(),
                    value,
                });
            }
            rdns.push(Rdn { avas });
        }

        Ok(Self { rdns })
    }

    #[must_use]
    pub fn rdns(&self) -> &[Rdn] {
        &self.rdns
    }

    /// The leftmost (most specific) RDN.
    #[must_use]
    pub fn leftmost(&self) -> Option<&Rdn> {
        self.rdns.first()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rdns.is_empty()
    }

    /// Whether this name lies at or below `base`, compared case-insensitively.
    #[must_use]
    pub fn is_under(&self, base: &DistinguishedName) -> bool {
        if base.rdns.len() > self.rdns.len() {
            return false;
        }
        let offset = self.rdns.len() - base.rdns.len();
        self.rdns[offset..]
            .iter()
            .zip(&base.rdns)
            .all(|(a, b)| a.eq_ignore_case(b))
    }

    /// Whether neither of two subtrees contains the other.
    #[must_use]
    pub fn is_disjoint_from(&self, other: &DistinguishedName) -> bool {
        !self.is_under(other) && !other.is_under(self)
    }
}

impl fmt::Display for DistinguishedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .rdns
            .iter()
            .map(|rdn| {
                rdn.avas
                    .iter()
                    .map(|ava| format!("{}={}", ava.attribute, escape_dn_value(&ava.value)))
                    .collect::<Vec<_>>()
                    .join("+")
            })
            .collect();
        write!(f, "{}", rendered.join(","))
    }
}

fn find_unescaped(s: &str, target: char) -> Option<usize> {
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == target {
            return Some(i);
        }
    }
    None
}

fn split_unescaped(s: &str, separators: &[char]) -> Result<Vec<String>, String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    let mut quoted = false;

    for c in s.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                current.push(c);
                quoted = !quoted;
            }
            c if !quoted && separators.contains(&c) => {
                parts.push(std::mem::take(&mut current));
            }
            c => current.push(c),
        }
    }

    if escaped {
        return Err("trailing escape character".to_string());
    }
    if quoted {
        return Err("unterminated quoted value".to_string());
    }
    parts.push(current);

    if parts.iter().any(|p| p.trim().is_empty()) {
        return Err("empty relative name".to_string());
    }
    Ok(parts)
}

fn unescape_value(raw: &str) -> Result<String, String> {
    if let Some(inner) = raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
        return unescape_value(inner);
    }

    let mut bytes = Vec::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        let first = chars.next().ok_or("trailing escape character")?;
        if first.is_ascii_hexdigit() {
            match chars.peek() {
                Some(second) if second.is_ascii_hexdigit() => {
                    let pair = format!("{first}{second}");
                    chars.next();
                    let byte = u8::from_str_radix(&pair, 16)
                        .map_err(|e| format!("invalid hex escape: {e}"))?;
                    bytes.push(byte);
                }
                _ => {
                    bytes.push(first as u8);
                }
            }
        } else {
            let mut buf = [0u8; 4];
            bytes.extend_from_slice(first.encode_utf8(&mut buf).as_bytes());
        }
    }

    String::from_utf8(bytes).map_err(|e| format!("invalid UTF-8 in escaped value: {e}"))
}

/// Escape special characters in LDAP filter values (RFC 4515).
#[must_use]
pub fn escape_filter_value(value: &str) -> String {
    value
        .replace('\\', "\\5c")
        .replace('*', "\\2a")
        .replace('(', "\\28")
        .replace(')', "\\29")
        .replace('\0', "\\00")
}

/// Escape special characters in DN attribute values (RFC 4514).
#[must_use]
pub fn escape_dn_value(value: &str) -> String {
    let count = value.chars().count();
    let mut result = String::with_capacity(value.len() * 2);

    for (i, ch) in value.chars().enumerate() {
        let is_first = i == 0;
        let is_last = i + 1 == count;

        match ch {
            ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=' => {
                result.push('\\');
                result.push(ch);
            }
            '\0' => result.push_str("\\00"),
            ' ' if is_first || is_last => result.push_str("\\20"),
            '#' if is_first => result.push_str("\\23"),
            _ => result.push(ch),
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_dn() {
        let dn = DistinguishedName::parse("uid=mmustermann,ou=users,dc=example,dc=com").unwrap();
        assert_eq!(dn.rdns().len(), 4);
        assert_eq!(dn.leftmost().unwrap().value_of("UID"), Some("mmustermann"));
    }

    #[test]
    fn test_parse_escaped_values() {
        let dn = DistinguishedName::parse(r"cn=Smith\, John,ou=users,dc=example,dc=com").unwrap();
        assert_eq!(dn.leftmost().unwrap().value_of("cn"), Some("Smith, John"));

        let dn = DistinguishedName::parse(r"cn=\20lead\2Ctrail,dc=com").unwrap();
        assert_eq!(dn.leftmost().unwrap().value_of("cn"), Some(" lead,trail"));

        let dn = DistinguishedName::parse(r#"cn="a,b",dc=com"#).unwrap();
        assert_eq!(dn.leftmost().unwrap().value_of("cn"), Some("a,b"));
    }

    #[test]
    fn test_parse_multi_valued_rdn() {
        let dn = DistinguishedName::parse("cn=dev+ou=eng,dc=com").unwrap();
        let rdn = dn.leftmost().unwrap();
        assert_eq!(rdn.avas().len(), 2);
        assert_eq!(rdn.value_of("ou"), Some("eng"));
    }

    #[test]
    fn test_parse_rejects_flat_names() {
        assert!(DistinguishedName::parse("mmustermann").is_err());
        assert!(DistinguishedName::parse("cn=x,").is_err());
        assert!(DistinguishedName::parse(r"cn=x\").is_err());
        assert!(DistinguishedName::parse("=x,dc=com").is_err());
        assert!(DistinguishedName::parse("c n=x").is_err());
    }

    #[test]
    fn test_is_under_case_insensitive() {
        let base = DistinguishedName::parse("OU=Users,DC=Example,DC=com").unwrap();
        let user = DistinguishedName::parse("uid=a,ou=users,dc=example,dc=com").unwrap();
        let group = DistinguishedName::parse("cn=g,ou=groups,dc=example,dc=com").unwrap();
        assert!(user.is_under(&base));
        assert!(!group.is_under(&base));
        assert!(base.is_under(&base));
    }

    #[test]
    fn test_disjoint_bases() {
        let users = DistinguishedName::parse("ou=users,dc=example,dc=com").unwrap();
        let groups = DistinguishedName::parse("ou=groups,dc=example,dc=com").unwrap();
        let root = DistinguishedName::parse("dc=example,dc=com").unwrap();
        assert!(users.is_disjoint_from(&groups));
        assert!(!users.is_disjoint_from(&root));
    }

    #[test]
    fn test_display_round_trips_escapes() {
        let dn = DistinguishedName::parse(r"cn=Smith\, John,dc=com").unwrap();
        assert_eq!(dn.to_string(), r"cn=Smith\, John,dc=com");
    }

    #[test]
    fn test_escape_filter_value() {
        assert_eq!(escape_filter_value("simple"), "simple");
        assert_eq!(escape_filter_value("a*b"), "a\\2ab");
        assert_eq!(escape_filter_value("(x)"), "\\28x\\29");
        assert_eq!(escape_filter_value("a\\b"), "a\\5cb");
        assert_eq!(escape_filter_value("*)(uid=*"), "\\2a\\29\\28uid=\\2a");
    }

    #[test]
    fn test_escape_dn_value() {
        assert_eq!(escape_dn_value("John Doe"), "John Doe");
        assert_eq!(escape_dn_value("Doe, John"), "Doe\\, John");
        assert_eq!(escape_dn_value(" lead"), "\\20lead");
        assert_eq!(escape_dn_value("trail "), "trail\\20");
        assert_eq!(escape_dn_value("#tag"), "\\23tag");
        assert_eq!(escape_dn_value("a\0b"), "a\\00b");
        assert_eq!(escape_dn_value("é "), "é\\20");
        assert_eq!(escape_dn_value(""), "");
    }
}
