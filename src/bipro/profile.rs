//! Per-VU behaviour differences as a dispatch table.
//!
//! Every carrier can deviate in STS envelope shape, confirmation
//! element and consumer-id requirements. A new carrier gets a new
//! table row; existing rows are never edited.

/// Shape of the STS request envelope (BiPRO 410).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StsStyle {
    /// WS-Trust `wst:*` request carrying `BiPROVersion` (e.g. Degenia).
    WsTrust,
    /// WS-Addressing `wsa:Action` header with a bare
    /// `RequestSecurityToken` (VEMA).
    Addressing,
}

/// Static description of one carrier profile.
#[derive(Debug)]
pub struct VuProfile {
    pub key: &'static str,
    /// SOAPAction header value; empty quoted string across the board.
    pub soap_action: &'static str,
    pub sts_style: StsStyle,
    /// Whether `<tran:BestaetigeLieferungen>` is sent on listShipments.
    pub include_confirm: bool,
    /// Whether `<nac:ConsumerID>` is mandatory.
    pub requires_consumer_id: bool,
    /// Lowercase substrings matched against the VU name.
    name_markers: &'static [&'static str],
    /// Lowercase substrings matched against endpoint URLs.
    url_markers: &'static [&'static str],
}

/// Detection table, most specific first. The default profile matches
/// everything and must stay last.
pub const PROFILES: &[VuProfile] = &[
    VuProfile {
        key: "vema",
        soap_action: "\"\"",
        sts_style: StsStyle::Addressing,
        include_confirm: false,
        requires_consumer_id: true,
        name_markers: &["vema"],
        url_markers: &["vemaeg.de"],
    },
    VuProfile {
        key: "default",
        soap_action: "\"\"",
        sts_style: StsStyle::WsTrust,
        include_confirm: true,
        requires_consumer_id: false,
        name_markers: &[],
        url_markers: &[],
    },
];

impl VuProfile {
    fn matches(&self, vu_name: &str, urls: &[&str]) -> bool {
        let name = vu_name.to_lowercase();
        if self.name_markers.iter().any(|m| name.contains(m)) {
            return true;
        }
        self.url_markers.iter().any(|marker| {
            urls.iter().any(|url| url.to_lowercase().contains(marker))
        })
    }
}

/// Pick the profile for a connection; falls through to the default row.
pub fn detect(vu_name: &str, urls: &[&str]) -> &'static VuProfile {
    PROFILES
        .iter()
        .find(|p| p.matches(vu_name, urls))
        .unwrap_or_else(|| PROFILES.last().expect("profile table is never empty"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_vema_by_name() {
        let profile = detect("VEMA eG", &[]);
        assert_eq!(profile.key, "vema");
        assert!(!profile.include_confirm);
        assert!(profile.requires_consumer_id);
        assert_eq!(profile.sts_style, StsStyle::Addressing);
    }

    #[test]
    fn test_detect_vema_by_url() {
        let profile = detect("", &["https://ws.vemaeg.de/430"]);
        assert_eq!(profile.key, "vema");
    }

    #[test]
    fn test_detect_default() {
        let profile = detect("Degenia", &["https://transfer.degenia.de/X4"]);
        assert_eq!(profile.key, "default");
        assert!(profile.include_confirm);
        assert!(!profile.requires_consumer_id);
        assert_eq!(profile.sts_style, StsStyle::WsTrust);
        assert_eq!(profile.soap_action, "\"\"");
    }

    #[test]
    fn test_default_row_is_last_and_catches_all() {
        assert_eq!(PROFILES.last().unwrap().key, "default");
        assert_eq!(detect("Unbekannte VU", &["https://example.org"]).key, "default");
    }
}
