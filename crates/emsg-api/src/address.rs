use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::net::IpAddr;
use thiserror::Error;

pub const DNS_PREFIX: &str = "_emsg.";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("empty address")]
    Empty,
    #[error("expected user#domain, got {0}")]
    MissingSeparator(String),
    #[error("empty user part")]
    EmptyUser,
    #[error("invalid user {0}")]
    InvalidUser(String),
    #[error("empty domain part")]
    EmptyDomain,
    #[error("invalid domain {0}")]
    InvalidDomain(String),
    #[error("invalid address at index {0}: {1}")]
    InvalidAt(usize, String),
}

/// A parsed `user#domain` address. Comparisons elsewhere use the raw form.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub user: String,
    pub domain: String,
    pub raw: String,
}

impl Address {
    pub fn parse(address: &str) -> Result<Self, AddressError> {
        if address.is_empty() {
            return Err(AddressError::Empty);
        }
        let mut parts = address.split('#');
        let (user, domain) = match (parts.next(), parts.next(), parts.next()) {
            (Some(user), Some(domain), None) => (user.trim(), domain.trim()),
            _ => return Err(AddressError::MissingSeparator(address.to_string())),
        };
        if user.is_empty() {
            return Err(AddressError::EmptyUser);
        }
        if !is_valid_user(user) {
            return Err(AddressError::InvalidUser(user.to_string()));
        }
        if domain.is_empty() {
            return Err(AddressError::EmptyDomain);
        }
        if !is_valid_domain(domain) {
            return Err(AddressError::InvalidDomain(domain.to_string()));
        }
        Ok(Address {
            user: user.to_string(),
            domain: domain.to_string(),
            raw: address.to_string(),
        })
    }

    /// DNS name for the server discovery TXT lookup.
    pub fn dns_name(&self) -> String {
        format!("{}{}", DNS_PREFIX, self.domain)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

fn is_valid_user(user: &str) -> bool {
    user.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

pub fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > 253 {
        return false;
    }
    if domain.parse::<IpAddr>().is_ok() {
        return false;
    }
    if !domain.contains('.') {
        return false;
    }
    domain.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

pub fn is_valid_address(address: &str) -> bool {
    Address::parse(address).is_ok()
}

/// Lowercases the domain part only. Idempotent; invalid input passes through.
pub fn normalize_address(address: &str) -> String {
    let trimmed = address.trim();
    let mut parts = trimmed.split('#');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(user), Some(domain), None) => {
            format!("{}#{}", user.trim(), domain.trim().to_lowercase())
        }
        _ => trimmed.to_string(),
    }
}

pub fn extract_domain(address: &str) -> Result<String, AddressError> {
    Ok(Address::parse(address)?.domain)
}

pub fn extract_user(address: &str) -> Result<String, AddressError> {
    Ok(Address::parse(address)?.user)
}

pub fn validate_address_list(addresses: &[String]) -> Result<(), AddressError> {
    for (i, addr) in addresses.iter().enumerate() {
        if !is_valid_address(addr) {
            return Err(AddressError::InvalidAt(i, addr.clone()));
        }
    }
    Ok(())
}

pub fn parse_address_list(addresses: &[String]) -> Result<Vec<Address>, AddressError> {
    addresses.iter().map(|a| Address::parse(a)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_user_and_domain() {
        let addr = Address::parse("alice#example.com").expect("parse");
        assert_eq!(addr.user, "alice");
        assert_eq!(addr.domain, "example.com");
        assert_eq!(addr.raw, "alice#example.com");
        assert_eq!(addr.dns_name(), "_emsg.example.com");
    }

    #[test]
    fn rejects_malformed_input() {
        assert_eq!(Address::parse(""), Err(AddressError::Empty));
        assert!(matches!(
            Address::parse("alice"),
            Err(AddressError::MissingSeparator(_))
        ));
        assert!(matches!(
            Address::parse("a#b#c"),
            Err(AddressError::MissingSeparator(_))
        ));
        assert_eq!(Address::parse("#example.com"), Err(AddressError::EmptyUser));
        assert_eq!(Address::parse("alice#"), Err(AddressError::EmptyDomain));
        assert!(matches!(
            Address::parse("al ice#example.com"),
            Err(AddressError::InvalidUser(_))
        ));
    }

    #[test]
    fn domain_rules() {
        assert!(is_valid_domain("example.com"));
        assert!(is_valid_domain("a.b-c.example.com"));
        assert!(!is_valid_domain("localhost"));
        assert!(!is_valid_domain("192.168.1.1"));
        assert!(!is_valid_domain("-bad.example.com"));
        assert!(!is_valid_domain("bad-.example.com"));
        assert!(!is_valid_domain(&format!("{}.com", "a".repeat(64))));
        assert!(!is_valid_domain(&"a.".repeat(127)));
    }

    #[test]
    fn normalize_lowercases_domain_only() {
        assert_eq!(
            normalize_address("Alice#Example.COM"),
            "Alice#example.com"
        );
        let once = normalize_address("Bob#TEST.org");
        assert_eq!(normalize_address(&once), once);
    }

    #[test]
    fn normalized_reparse_matches() {
        let addr = Address::parse("carol#Mixed.Example.com").expect("parse");
        let normalized = normalize_address(&addr.raw);
        let reparsed = Address::parse(&normalized).expect("reparse");
        assert_eq!(reparsed.user, addr.user);
        assert_eq!(reparsed.domain, addr.domain.to_lowercase());
    }

    #[test]
    fn list_validation_reports_index() {
        let list = vec![
            "alice#example.com".to_string(),
            "not-an-address".to_string(),
        ];
        assert!(matches!(
            validate_address_list(&list),
            Err(AddressError::InvalidAt(1, _))
        ));
        assert!(validate_address_list(&list[..1]).is_ok());
    }
}
