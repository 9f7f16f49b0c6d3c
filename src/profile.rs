//! Advisory per-principal data kept in the store: alias and display-name
//! caches, the admin forward window, and the user profile.

use crate::store::{Store, StoreError};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::warn;

const PROFILE_TTL: Duration = Duration::from_secs(30 * 24 * 3600);
const ALIAS_TTL: Duration = Duration::from_secs(30 * 24 * 3600);
const FORWARD_WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crop_percentage: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_images_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_processed_time: Option<i64>,
}

/// `@Nick`, `nick` and ` @NICK ` all normalize to `@nick`.
pub fn normalize_alias(raw: &str) -> Option<String> {
    let bare = raw.trim().trim_start_matches('@');
    if bare.is_empty() || bare.contains(char::is_whitespace) {
        return None;
    }
    Some(format!("@{}", bare.to_lowercase()))
}

#[derive(Clone)]
pub struct PrincipalDirectory {
    store: Arc<dyn Store>,
}

impl PrincipalDirectory {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Refreshes the alias and display-name caches from a fresh sighting.
    pub async fn remember(
        &self,
        principal: u64,
        username: Option<&str>,
        full_name: Option<&str>,
    ) -> Result<(), StoreError> {
        if let Some(alias) = username.and_then(normalize_alias) {
            self.store
                .set_ex(&format!("username_to_id:{alias}"), &principal.to_string(), ALIAS_TTL)
                .await?;
            self.store
                .set_ex(&format!("id_to_username:{principal}"), &alias, ALIAS_TTL)
                .await?;
        }
        if let Some(name) = full_name.map(str::trim).filter(|n| !n.is_empty()) {
            self.set_full_name(principal, name).await?;
        }
        Ok(())
    }

    /// `None` when the alias was never seen or is only a pending placeholder.
    pub async fn resolve_alias(&self, alias: &str) -> Result<Option<u64>, StoreError> {
        let Some(alias) = normalize_alias(alias) else {
            return Ok(None);
        };
        let raw = self.store.get(&format!("username_to_id:{alias}")).await?;
        Ok(raw.and_then(|v| v.trim().parse::<u64>().ok()))
    }

    /// Records an alias an admin wants allowed before its owner has been seen.
    pub async fn mark_pending_alias(&self, alias: &str) -> Result<(), StoreError> {
        let Some(alias) = normalize_alias(alias) else {
            return Ok(());
        };
        self.store
            .set_ex(&format!("username_to_id:{alias}"), "", ALIAS_TTL)
            .await
    }

    pub async fn link_alias(&self, principal: u64, alias: &str) -> Result<(), StoreError> {
        self.remember(principal, Some(alias), None).await
    }

    pub async fn alias_of(&self, principal: u64) -> Result<Option<String>, StoreError> {
        Ok(self
            .store
            .get(&format!("id_to_username:{principal}"))
            .await?
            .filter(|v| !v.is_empty()))
    }

    pub async fn full_name_of(&self, principal: u64) -> Result<Option<String>, StoreError> {
        Ok(self
            .store
            .get(&format!("id_to_fullname:{principal}"))
            .await?
            .filter(|v| !v.is_empty()))
    }

    pub async fn set_full_name(&self, principal: u64, name: &str) -> Result<(), StoreError> {
        self.store
            .set_ex(&format!("id_to_fullname:{principal}"), name, ALIAS_TTL)
            .await
    }

    pub async fn arm_forward_window(&self, admin: u64) -> Result<(), StoreError> {
        self.store
            .set_ex(&format!("admin:await_forward:{admin}"), "1", FORWARD_WINDOW)
            .await
    }

    pub async fn forward_window_open(&self, admin: u64) -> Result<bool, StoreError> {
        Ok(self
            .store
            .get(&format!("admin:await_forward:{admin}"))
            .await?
            .is_some())
    }

    pub async fn close_forward_window(&self, admin: u64) -> Result<(), StoreError> {
        self.store.delete(&format!("admin:await_forward:{admin}")).await
    }

    /// A corrupt profile is logged and read as empty.
    pub async fn load_profile(&self, principal: u64) -> Result<UserProfile, StoreError> {
        let Some(raw) = self.store.get(&profile_key(principal)).await? else {
            return Ok(UserProfile::default());
        };
        match serde_json::from_str(&raw) {
            Ok(profile) => Ok(profile),
            Err(err) => {
                warn!(target = "listing_bot.profile", principal, error = %err, "corrupt profile ignored");
                Ok(UserProfile::default())
            }
        }
    }

    pub async fn save_profile(&self, principal: u64, profile: &UserProfile) -> Result<(), StoreError> {
        let raw = serde_json::to_string(profile).map_err(|err| StoreError::Corrupt(err.to_string()))?;
        self.store.set_ex(&profile_key(principal), &raw, PROFILE_TTL).await
    }
}

fn profile_key(principal: u64) -> String {
    format!("el_estate_bot:user:{principal}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn directory() -> (Arc<MemoryStore>, PrincipalDirectory) {
        let store = Arc::new(MemoryStore::default());
        (store.clone(), PrincipalDirectory::new(store))
    }

    #[test]
    fn alias_normalization() {
        assert_eq!(normalize_alias(" @Olena_K "), Some("@olena_k".into()));
        assert_eq!(normalize_alias("ivan"), Some("@ivan".into()));
        assert_eq!(normalize_alias("@"), None);
        assert_eq!(normalize_alias("two words"), None);
    }

    #[tokio::test]
    async fn remembered_alias_resolves_both_ways() {
        let (_, dir) = directory();
        dir.remember(42, Some("Olena"), Some("Olena K")).await.unwrap();
        assert_eq!(dir.resolve_alias("@OLENA").await.unwrap(), Some(42));
        assert_eq!(dir.alias_of(42).await.unwrap(), Some("@olena".into()));
        assert_eq!(dir.full_name_of(42).await.unwrap(), Some("Olena K".into()));
    }

    #[tokio::test]
    async fn pending_alias_does_not_resolve() {
        let (_, dir) = directory();
        dir.mark_pending_alias("@newbie").await.unwrap();
        assert_eq!(dir.resolve_alias("@newbie").await.unwrap(), None);
        dir.remember(7, Some("newbie"), None).await.unwrap();
        assert_eq!(dir.resolve_alias("@newbie").await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn forward_window_lifecycle() {
        let (_, dir) = directory();
        assert!(!dir.forward_window_open(1).await.unwrap());
        dir.arm_forward_window(1).await.unwrap();
        assert!(dir.forward_window_open(1).await.unwrap());
        dir.close_forward_window(1).await.unwrap();
        assert!(!dir.forward_window_open(1).await.unwrap());
    }

    #[tokio::test]
    async fn profile_roundtrip_and_corruption() {
        let (store, dir) = directory();
        assert_eq!(dir.load_profile(5).await.unwrap(), UserProfile::default());

        let profile = UserProfile {
            crop_percentage: Some(10),
            last_url: Some("https://www.otodom.pl/pl/oferta/x".into()),
            ..UserProfile::default()
        };
        dir.save_profile(5, &profile).await.unwrap();
        assert_eq!(dir.load_profile(5).await.unwrap(), profile);

        store
            .set_ex("el_estate_bot:user:5", "{not json", PROFILE_TTL)
            .await
            .unwrap();
        assert_eq!(dir.load_profile(5).await.unwrap(), UserProfile::default());
    }
}
