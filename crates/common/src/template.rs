//! Client config rendering
//!
//! Templates are plain `wg-quick` configs with three placeholder tokens.
//! Substitution is literal; tokens the template does not contain are simply
//! not used and anything else that looks like a token is left untouched.

use crate::{Error, Result};
use std::net::Ipv4Addr;
use std::path::Path;

pub const ADDRESS_TOKEN: &str = "%AD%";
pub const PRIVATE_KEY_TOKEN: &str = "%PrK%";
pub const PRESHARED_KEY_TOKEN: &str = "%PhK%";

/// Fill `template` for one peer
///
/// All tokens are located against the original text in one pass, so a key
/// that happens to contain a token can never be substituted again.
pub fn render(template: &str, address: Ipv4Addr, private_key: &str, preshared_key: &str) -> String {
    let address = address.to_string();
    let tokens = [
        (ADDRESS_TOKEN, address.as_str()),
        (PRIVATE_KEY_TOKEN, private_key),
        (PRESHARED_KEY_TOKEN, preshared_key),
    ];

    let mut out = String::with_capacity(template.len() + 128);
    let mut rest = template;
    loop {
        let next = tokens
            .iter()
            .filter_map(|(token, value)| rest.find(token).map(|pos| (pos, *token, *value)))
            .min_by_key(|(pos, _, _)| *pos);

        match next {
            Some((pos, token, value)) => {
                out.push_str(&rest[..pos]);
                out.push_str(value);
                rest = &rest[pos + token.len()..];
            }
            None => {
                out.push_str(rest);
                return out;
            }
        }
    }
}

/// A template loaded from disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigTemplate {
    text: String,
}

impl ConfigTemplate {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        std::fs::read_to_string(path)
            .map(Self::new)
            .map_err(|e| Error::Template(format!("cannot read template {:?}: {}", path, e)))
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn render(&self, address: Ipv4Addr, private_key: &str, preshared_key: &str) -> String {
        render(&self.text, address, private_key, preshared_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TEMPLATE: &str = "[Interface]\nAddress = %AD%/32\nPrivateKey = %PrK%\n\n[Peer]\nPresharedKey = %PhK%\nEndpoint = %HOST%:51820\n";

    #[test]
    fn test_render_substitutes_every_token() {
        let text = render(TEMPLATE, Ipv4Addr::new(10, 8, 0, 2), "PRIV", "PSK");
        assert!(text.contains("Address = 10.8.0.2/32"));
        assert!(text.contains("PrivateKey = PRIV"));
        assert!(text.contains("PresharedKey = PSK"));
        assert!(!text.contains("%AD%"));
    }

    #[test]
    fn test_unknown_tokens_are_left_alone() {
        let text = render(TEMPLATE, Ipv4Addr::new(10, 8, 0, 2), "PRIV", "PSK");
        assert!(text.contains("Endpoint = %HOST%:51820"));
    }

    #[test]
    fn test_missing_tokens_are_fine() {
        let text = render("[Interface]\n", Ipv4Addr::new(10, 8, 0, 2), "PRIV", "PSK");
        assert_eq!(text, "[Interface]\n");
    }

    #[test]
    fn test_values_are_not_rescanned() {
        let text = render("%PrK% %PhK%", Ipv4Addr::new(10, 8, 0, 2), "%PhK%", "psk");
        assert_eq!(text, "%PhK% psk");
    }

    #[test]
    fn test_repeated_tokens() {
        let text = render("%AD% %AD%", Ipv4Addr::new(10, 8, 0, 3), "", "");
        assert_eq!(text, "10.8.0.3 10.8.0.3");
    }

    #[test]
    fn test_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("template.conf");
        std::fs::write(&path, TEMPLATE).unwrap();

        let template = ConfigTemplate::load(&path).unwrap();
        assert_eq!(template.text(), TEMPLATE);

        let missing = ConfigTemplate::load(tmp.path().join("nope.conf")).unwrap_err();
        assert!(matches!(missing, Error::Template(_)));
    }
}
