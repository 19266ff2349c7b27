//! Keyring helpers for server and catalog secrets.

use keyring::Entry;

const PLEX_SERVICE_NAME: &str = "artist-enricher.plex";
const SPOTIFY_SERVICE_NAME: &str = "artist-enricher.spotify";

/// Which secret a keyring entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SecretKind {
    /// Plex token, keyed by server URL.
    Plex,
    /// Spotify client secret, keyed by client id.
    Spotify,
}

impl SecretKind {
    fn service_name(self) -> &'static str {
        match self {
            Self::Plex => PLEX_SERVICE_NAME,
            Self::Spotify => SPOTIFY_SERVICE_NAME,
        }
    }
}

fn secret_entry(kind: SecretKind, account: &str) -> Result<Entry, String> {
    Entry::new(kind.service_name(), account.trim())
        .map_err(|err| format!("failed to create keyring entry: {err}"))
}

/// Saves a secret into the OS keyring.
pub fn set_secret(kind: SecretKind, account: &str, secret: &str) -> Result<(), String> {
    let entry = secret_entry(kind, account)?;
    entry
        .set_password(secret)
        .map_err(|err| format!("failed to set keyring password: {err}"))
}

/// Loads a secret from the OS keyring.
pub fn get_secret(kind: SecretKind, account: &str) -> Result<Option<String>, String> {
    let entry = secret_entry(kind, account)?;
    match entry.get_password() {
        Ok(secret) => Ok(Some(secret)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(err) => Err(format!("failed to get keyring password: {err}")),
    }
}

/// Prefers a secret written in the config file and falls back to the keyring.
pub fn resolve_secret(
    configured: &str,
    kind: SecretKind,
    account: &str,
) -> Result<Option<String>, String> {
    let configured = configured.trim();
    if !configured.is_empty() {
        return Ok(Some(configured.to_string()));
    }
    get_secret(kind, account)
}

#[cfg(test)]
mod tests {
    use super::{resolve_secret, SecretKind};

    #[test]
    fn test_configured_secret_wins_without_keyring_lookup() {
        assert_eq!(
            resolve_secret("  token-123 ", SecretKind::Plex, "http://localhost:32400"),
            Ok(Some("token-123".to_string()))
        );
    }

    #[test]
    fn test_service_names_are_distinct() {
        assert_ne!(
            SecretKind::Plex.service_name(),
            SecretKind::Spotify.service_name()
        );
    }
}
