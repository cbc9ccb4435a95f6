//! Album selection from configured include/exclude rules.

use std::collections::HashSet;

use thiserror::Error;

use crate::icloud::{Album, AlbumKind};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FilterError {
    /// A configured album name matched nothing in the discovered listing.
    /// Fatal for the cycle: a typo here would silently sync nothing.
    #[error("configured album not found in the library: {0}")]
    ConfiguredAlbumMissing(String),
}

/// Which albums to sync, resolved from configuration each cycle.
#[derive(Debug, Clone, Default)]
pub struct AlbumRules {
    pub include_personal: bool,
    pub include_shared: bool,
    /// Empty = all albums of that kind.
    pub personal_allowlist: Vec<String>,
    pub shared_allowlist: Vec<String>,
}

/// Resolve `rules` against the discovered albums.
///
/// Matching is case-sensitive, whole-name equality. Every allowlisted name
/// must exist among the discovered albums of its kind; a miss fails the
/// cycle with [`FilterError::ConfiguredAlbumMissing`].
pub fn select_albums(discovered: &[Album], rules: &AlbumRules) -> Result<Vec<Album>, FilterError> {
    let mut selected = Vec::new();
    selected.extend(select_kind(
        discovered,
        AlbumKind::Personal,
        rules.include_personal,
        &rules.personal_allowlist,
    )?);
    selected.extend(select_kind(
        discovered,
        AlbumKind::Shared,
        rules.include_shared,
        &rules.shared_allowlist,
    )?);
    Ok(selected)
}

fn select_kind(
    discovered: &[Album],
    kind: AlbumKind,
    include: bool,
    allowlist: &[String],
) -> Result<Vec<Album>, FilterError> {
    if !include {
        return Ok(Vec::new());
    }

    let of_kind: Vec<&Album> = discovered.iter().filter(|a| a.kind == kind).collect();

    if allowlist.is_empty() {
        return Ok(of_kind.into_iter().cloned().collect());
    }

    let names: HashSet<&str> = of_kind.iter().map(|a| a.name.as_str()).collect();
    for wanted in allowlist {
        if !names.contains(wanted.as_str()) {
            return Err(FilterError::ConfiguredAlbumMissing(wanted.clone()));
        }
    }

    Ok(of_kind
        .into_iter()
        .filter(|a| allowlist.iter().any(|w| w == &a.name))
        .cloned()
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn album(name: &str, kind: AlbumKind) -> Album {
        Album {
            name: name.to_string(),
            kind,
            item_count: 0,
        }
    }

    fn names(albums: &[Album]) -> Vec<&str> {
        albums.iter().map(|a| a.name.as_str()).collect()
    }

    #[test]
    fn empty_allowlist_selects_all_of_kind() {
        let discovered = vec![
            album("Trip", AlbumKind::Personal),
            album("Home", AlbumKind::Personal),
            album("Family", AlbumKind::Shared),
        ];
        let rules = AlbumRules {
            include_personal: true,
            include_shared: true,
            ..Default::default()
        };
        let selected = select_albums(&discovered, &rules).unwrap();
        assert_eq!(names(&selected), vec!["Trip", "Home", "Family"]);
    }

    #[test]
    fn excluded_kind_is_dropped() {
        let discovered = vec![
            album("Trip", AlbumKind::Personal),
            album("Family", AlbumKind::Shared),
        ];
        let rules = AlbumRules {
            include_personal: true,
            include_shared: false,
            ..Default::default()
        };
        let selected = select_albums(&discovered, &rules).unwrap();
        assert_eq!(names(&selected), vec!["Trip"]);
    }

    #[test]
    fn allowlist_narrows_selection() {
        let discovered = vec![
            album("Keep", AlbumKind::Personal),
            album("Skip", AlbumKind::Personal),
        ];
        let rules = AlbumRules {
            include_personal: true,
            include_shared: false,
            personal_allowlist: vec!["Keep".to_string()],
            ..Default::default()
        };
        let selected = select_albums(&discovered, &rules).unwrap();
        assert_eq!(names(&selected), vec!["Keep"]);
    }

    #[test]
    fn missing_configured_album_fails() {
        let discovered = vec![album("Keep", AlbumKind::Personal)];
        let rules = AlbumRules {
            include_personal: true,
            include_shared: false,
            personal_allowlist: vec!["Ghost".to_string()],
            ..Default::default()
        };
        assert_eq!(
            select_albums(&discovered, &rules),
            Err(FilterError::ConfiguredAlbumMissing("Ghost".to_string()))
        );
    }

    #[test]
    fn matching_is_case_sensitive() {
        let discovered = vec![album("Keep", AlbumKind::Personal)];
        let rules = AlbumRules {
            include_personal: true,
            include_shared: false,
            personal_allowlist: vec!["keep".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            select_albums(&discovered, &rules),
            Err(FilterError::ConfiguredAlbumMissing(_))
        ));
    }

    #[test]
    fn shared_allowlist_independent_of_personal() {
        let discovered = vec![
            album("Trip", AlbumKind::Personal),
            album("Trip", AlbumKind::Shared),
            album("Family", AlbumKind::Shared),
        ];
        let rules = AlbumRules {
            include_personal: true,
            include_shared: true,
            shared_allowlist: vec!["Family".to_string()],
            ..Default::default()
        };
        let selected = select_albums(&discovered, &rules).unwrap();
        assert_eq!(names(&selected), vec!["Trip", "Family"]);
    }
}
