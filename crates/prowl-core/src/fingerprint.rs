//! Browser identity bundles presented consistently for one session.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// User agent, default headers and viewport of one browser identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintProfile {
    pub id: String,
    pub user_agent: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub viewport: Viewport,
}

impl FingerprintProfile {
    fn desktop(
        id: &str,
        user_agent: &str,
        accept_language: &str,
        extra: &[(&str, &str)],
        viewport: (u32, u32),
    ) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert(
            "Accept".to_string(),
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string(),
        );
        headers.insert("Accept-Language".to_string(), accept_language.to_string());
        headers.insert("Upgrade-Insecure-Requests".to_string(), "1".to_string());
        for (k, v) in extra {
            headers.insert((*k).to_string(), (*v).to_string());
        }

        Self {
            id: id.to_string(),
            user_agent: user_agent.to_string(),
            headers,
            viewport: Viewport {
                width: viewport.0,
                height: viewport.1,
            },
        }
    }
}

/// Fixed catalog that sessions pick their identity from.
#[derive(Debug, Clone)]
pub struct FingerprintCatalog {
    profiles: Vec<FingerprintProfile>,
}

impl FingerprintCatalog {
    pub fn new(profiles: Vec<FingerprintProfile>) -> Result<Self, AppError> {
        if profiles.is_empty() {
            return Err(AppError::ConfigError(
                "Fingerprint catalog must contain at least one profile".into(),
            ));
        }
        Ok(Self { profiles })
    }

    /// Configured profiles, or the built-in desktop set when none are configured.
    pub fn from_config(profiles: &[FingerprintProfile]) -> Result<Self, AppError> {
        if profiles.is_empty() {
            Ok(Self::builtin())
        } else {
            Self::new(profiles.to_vec())
        }
    }

    pub fn builtin() -> Self {
        let profiles = vec![
            FingerprintProfile::desktop(
                "chrome-win-1080p",
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
                "ja-JP,ja;q=0.9,en-US;q=0.8,en;q=0.7",
                &[
                    (
                        "sec-ch-ua",
                        "\"Chromium\";v=\"124\", \"Google Chrome\";v=\"124\", \"Not-A.Brand\";v=\"99\"",
                    ),
                    ("sec-ch-ua-mobile", "?0"),
                    ("sec-ch-ua-platform", "\"Windows\""),
                ],
                (1920, 1080),
            ),
            FingerprintProfile::desktop(
                "chrome-mac-1440p",
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
                "ja,en-US;q=0.9,en;q=0.8",
                &[
                    (
                        "sec-ch-ua",
                        "\"Google Chrome\";v=\"123\", \"Not:A-Brand\";v=\"8\", \"Chromium\";v=\"123\"",
                    ),
                    ("sec-ch-ua-mobile", "?0"),
                    ("sec-ch-ua-platform", "\"macOS\""),
                ],
                (1440, 900),
            ),
            FingerprintProfile::desktop(
                "firefox-win-768p",
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
                "ja,en-US;q=0.7,en;q=0.3",
                &[("DNT", "1")],
                (1366, 768),
            ),
            FingerprintProfile::desktop(
                "firefox-linux-1080p",
                "Mozilla/5.0 (X11; Linux x86_64; rv:124.0) Gecko/20100101 Firefox/124.0",
                "ja-JP,ja;q=0.8,en-US;q=0.5,en;q=0.3",
                &[],
                (1920, 1080),
            ),
            FingerprintProfile::desktop(
                "safari-mac-1280p",
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
                "ja-JP,ja;q=0.9",
                &[],
                (1280, 800),
            ),
            FingerprintProfile::desktop(
                "edge-win-1536p",
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0",
                "ja,en;q=0.9,en-GB;q=0.8,en-US;q=0.7",
                &[
                    (
                        "sec-ch-ua",
                        "\"Chromium\";v=\"124\", \"Microsoft Edge\";v=\"124\", \"Not-A.Brand\";v=\"99\"",
                    ),
                    ("sec-ch-ua-mobile", "?0"),
                    ("sec-ch-ua-platform", "\"Windows\""),
                ],
                (1536, 864),
            ),
        ];
        Self { profiles }
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn profiles(&self) -> &[FingerprintProfile] {
        &self.profiles
    }

    /// Picks a profile by hashing the session id. Same id, same profile.
    pub fn select(&self, session_id: &str) -> &FingerprintProfile {
        let digest = Sha256::digest(session_id.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        let index = (u64::from_be_bytes(head) % self.profiles.len() as u64) as usize;
        &self.profiles[index]
    }
}
