//! Effective watermark resolution over the resource hierarchy
//!
//! A resource's own assignment wins. Without one, media inherit from their
//! item and items from the first of their item sets (lowest id) that carries
//! an assignment. When nothing in the chain decides, the enabled default set
//! applies. An explicit opt-out anywhere on the media → item path stops the
//! walk and yields no watermark.

use crate::error::{Result, WatermarkError};
use crate::models::{
    AssignmentTarget, ResourceAssignment, ResourceRef, ResourceType, WatermarkSet,
};
use crate::store::{ResourceLookup, WatermarkStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Where an effective watermark set came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolutionSource {
    /// The resource's own assignment
    Direct,
    /// An assignment on an ancestor
    Inherited { from: ResourceRef },
    /// The system-wide default set
    Default,
    /// Watermarking was switched off on the resource or its item
    ExplicitNone,
    /// Nothing applies
    Unassigned,
}

/// Effective set together with its origin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub set: Option<WatermarkSet>,
    pub source: ResolutionSource,
}

/// What a single resource's own assignment says
enum Direct {
    Set(WatermarkSet),
    NoWatermark,
}

/// Resolves and edits watermark assignments
#[derive(Clone)]
pub struct AssignmentResolver {
    store: Arc<dyn WatermarkStore>,
    resources: Arc<dyn ResourceLookup>,
}

impl AssignmentResolver {
    pub fn new(store: Arc<dyn WatermarkStore>, resources: Arc<dyn ResourceLookup>) -> Self {
        Self { store, resources }
    }

    /// The watermark set that applies to a resource, if any.
    ///
    /// A directly or inherited assigned set is returned even when disabled;
    /// the default fallback only ever yields an enabled set.
    pub async fn resolve_effective_watermark_set(
        &self,
        resource: ResourceRef,
    ) -> Result<Option<WatermarkSet>> {
        Ok(self.resolve_with_source(resource).await?.set)
    }

    /// Resolve and report which rule produced the answer
    #[instrument(skip(self))]
    pub async fn resolve_with_source(&self, resource: ResourceRef) -> Result<Resolution> {
        self.require_exists(resource).await?;

        let resolution = match self.walk(resource).await? {
            Some((Direct::Set(set), from)) if from == resource => Resolution {
                set: Some(set),
                source: ResolutionSource::Direct,
            },
            Some((Direct::Set(set), from)) => Resolution {
                set: Some(set),
                source: ResolutionSource::Inherited { from },
            },
            Some((Direct::NoWatermark, _)) => Resolution {
                set: None,
                source: ResolutionSource::ExplicitNone,
            },
            None => match self.store.default_set().await? {
                Some(set) => Resolution {
                    set: Some(set),
                    source: ResolutionSource::Default,
                },
                None => Resolution {
                    set: None,
                    source: ResolutionSource::Unassigned,
                },
            },
        };

        debug!(
            set_id = ?resolution.set.as_ref().map(|s| s.id),
            source = ?resolution.source,
            "Resolved effective watermark set"
        );
        Ok(resolution)
    }

    /// Change a resource's own assignment.
    ///
    /// Returns the stored row, or `None` when the override was dropped.
    #[instrument(skip(self))]
    pub async fn set_assignment(
        &self,
        resource: ResourceRef,
        target: AssignmentTarget,
    ) -> Result<Option<ResourceAssignment>> {
        self.require_exists(resource).await?;

        match target {
            AssignmentTarget::NoWatermark => {
                let row = self.store.upsert_assignment(resource, None, true).await?;
                info!("Disabled watermarking for {}", resource);
                Ok(Some(row))
            }
            AssignmentTarget::Default => {
                if self.store.delete_assignment(resource).await? {
                    info!("Cleared watermark assignment for {}", resource);
                }
                Ok(None)
            }
            AssignmentTarget::Set(set_id) => {
                let set = self.store.get_set(set_id).await?.ok_or_else(|| {
                    WatermarkError::invalid_assignment(format!(
                        "watermark set {} does not exist",
                        set_id
                    ))
                })?;
                if !set.enabled {
                    return Err(WatermarkError::invalid_assignment(format!(
                        "watermark set {} ('{}') is disabled",
                        set.id, set.name
                    )));
                }

                let row = self
                    .store
                    .upsert_assignment(resource, Some(set.id), false)
                    .await?;
                info!("Assigned watermark set '{}' to {}", set.name, resource);
                Ok(Some(row))
            }
        }
    }

    /// The resource's own assignment row, if it has one
    pub async fn get_assignment(&self, resource: ResourceRef) -> Result<Option<ResourceAssignment>> {
        self.store.find_assignment(resource).await
    }

    async fn require_exists(&self, resource: ResourceRef) -> Result<()> {
        if self.resources.exists(resource).await? {
            Ok(())
        } else {
            Err(WatermarkError::ResourceNotFound { resource })
        }
    }

    /// Walk media → item → item sets, returning the first deciding
    /// assignment and the resource it sits on
    async fn walk(&self, resource: ResourceRef) -> Result<Option<(Direct, ResourceRef)>> {
        if let Some(direct) = self.direct(resource).await? {
            return Ok(Some((direct, resource)));
        }

        match resource.resource_type {
            ResourceType::Media => {
                for item in self.resources.parents(resource).await? {
                    if let Some(direct) = self.direct(item).await? {
                        return Ok(Some((direct, item)));
                    }
                    if let Some(found) = self.first_item_set_with_set(item).await? {
                        return Ok(Some(found));
                    }
                }
                Ok(None)
            }
            ResourceType::Item => self.first_item_set_with_set(resource).await,
            ResourceType::ItemSet => Ok(None),
        }
    }

    /// First item set of `item` (ascending id) whose own assignment names a
    /// set. Item sets that opt out or have nothing are passed over.
    async fn first_item_set_with_set(
        &self,
        item: ResourceRef,
    ) -> Result<Option<(Direct, ResourceRef)>> {
        for item_set in self.resources.parents(item).await? {
            if let Some(Direct::Set(set)) = self.direct(item_set).await? {
                return Ok(Some((Direct::Set(set), item_set)));
            }
        }
        Ok(None)
    }

    /// A resource's own assignment, if it decides anything.
    ///
    /// Rows left without a set (their set was deleted) behave like no row.
    async fn direct(&self, resource: ResourceRef) -> Result<Option<Direct>> {
        let Some(assignment) = self.store.find_assignment(resource).await? else {
            return Ok(None);
        };

        if assignment.explicitly_no_watermark {
            return Ok(Some(Direct::NoWatermark));
        }

        match assignment.watermark_set_id {
            Some(set_id) => Ok(self.store.get_set(set_id).await?.map(Direct::Set)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::database::DatabaseManager;
    use crate::models::{NewWatermarkSet, SetId, WatermarkSetUpdate};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        db: Arc<DatabaseManager>,
        resolver: AssignmentResolver,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = DatabaseConfig {
            database_url: format!("sqlite:{}", dir.path().join("test.db").display()),
            ..Default::default()
        };
        let db = Arc::new(DatabaseManager::new(&config).await.unwrap());

        // item set 2 and 9, item 5 in both, media 42 in item 5
        db.register_item_set(2, "Summer").await.unwrap();
        db.register_item_set(9, "Archive").await.unwrap();
        db.register_item(5, "Beach").await.unwrap();
        db.link_item_to_set(5, 2).await.unwrap();
        db.link_item_to_set(5, 9).await.unwrap();
        db.register_media(42, 5, "beach.jpg", "image/jpeg").await.unwrap();

        // item 3 with media 7, in no item set
        db.register_item(3, "Portrait").await.unwrap();
        db.register_media(7, 3, "face.png", "image/png").await.unwrap();

        let resolver = AssignmentResolver::new(db.clone(), db.clone());
        Fixture {
            _dir: dir,
            db,
            resolver,
        }
    }

    async fn create_set(db: &DatabaseManager, name: &str, is_default: bool) -> SetId {
        let mut new_set = NewWatermarkSet::new(name);
        new_set.is_default = is_default;
        db.create_set(&new_set).await.unwrap().id
    }

    #[tokio::test]
    async fn test_media_inherits_from_item_set() {
        let f = fixture().await;
        let holiday = create_set(&f.db, "Holiday", false).await;
        f.resolver
            .set_assignment(ResourceRef::item_set(2), AssignmentTarget::Set(holiday))
            .await
            .unwrap();

        let resolution = f.resolver.resolve_with_source(ResourceRef::media(42)).await.unwrap();
        assert_eq!(resolution.set.unwrap().name, "Holiday");
        assert_eq!(
            resolution.source,
            ResolutionSource::Inherited {
                from: ResourceRef::item_set(2)
            }
        );
    }

    #[tokio::test]
    async fn test_explicit_none_on_media_is_terminal() {
        let f = fixture().await;
        let holiday = create_set(&f.db, "Holiday", false).await;
        create_set(&f.db, "Fallback", true).await;

        f.resolver
            .set_assignment(ResourceRef::item(3), AssignmentTarget::Set(holiday))
            .await
            .unwrap();
        f.resolver
            .set_assignment(ResourceRef::media(7), AssignmentTarget::NoWatermark)
            .await
            .unwrap();

        let resolution = f.resolver.resolve_with_source(ResourceRef::media(7)).await.unwrap();
        assert!(resolution.set.is_none());
        assert_eq!(resolution.source, ResolutionSource::ExplicitNone);
    }

    #[tokio::test]
    async fn test_explicit_none_on_item_is_terminal_for_media() {
        let f = fixture().await;
        let holiday = create_set(&f.db, "Holiday", true).await;
        f.resolver
            .set_assignment(ResourceRef::item_set(2), AssignmentTarget::Set(holiday))
            .await
            .unwrap();
        f.resolver
            .set_assignment(ResourceRef::item(5), AssignmentTarget::NoWatermark)
            .await
            .unwrap();

        assert!(f
            .resolver
            .resolve_effective_watermark_set(ResourceRef::media(42))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_direct_assignment_wins() {
        let f = fixture().await;
        let holiday = create_set(&f.db, "Holiday", false).await;
        let special = create_set(&f.db, "Special", false).await;
        f.resolver
            .set_assignment(ResourceRef::item(5), AssignmentTarget::Set(holiday))
            .await
            .unwrap();
        f.resolver
            .set_assignment(ResourceRef::media(42), AssignmentTarget::Set(special))
            .await
            .unwrap();

        let resolution = f.resolver.resolve_with_source(ResourceRef::media(42)).await.unwrap();
        assert_eq!(resolution.set.unwrap().id, special);
        assert_eq!(resolution.source, ResolutionSource::Direct);

        let resolution = f.resolver.resolve_with_source(ResourceRef::item(5)).await.unwrap();
        assert_eq!(resolution.set.unwrap().id, holiday);
        assert_eq!(resolution.source, ResolutionSource::Direct);
    }

    #[tokio::test]
    async fn test_lowest_item_set_wins_and_opt_outs_are_skipped() {
        let f = fixture().await;
        let summer = create_set(&f.db, "Summer", false).await;
        let archive = create_set(&f.db, "Archive", false).await;

        f.resolver
            .set_assignment(ResourceRef::item_set(9), AssignmentTarget::Set(archive))
            .await
            .unwrap();
        f.resolver
            .set_assignment(ResourceRef::item_set(2), AssignmentTarget::Set(summer))
            .await
            .unwrap();
        let set = f
            .resolver
            .resolve_effective_watermark_set(ResourceRef::item(5))
            .await
            .unwrap();
        assert_eq!(set.unwrap().id, summer);

        f.resolver
            .set_assignment(ResourceRef::item_set(2), AssignmentTarget::NoWatermark)
            .await
            .unwrap();
        let set = f
            .resolver
            .resolve_effective_watermark_set(ResourceRef::media(42))
            .await
            .unwrap();
        assert_eq!(set.unwrap().id, archive);
    }

    #[tokio::test]
    async fn test_default_fallback() {
        let f = fixture().await;

        let resolution = f.resolver.resolve_with_source(ResourceRef::media(42)).await.unwrap();
        assert_eq!(resolution.source, ResolutionSource::Unassigned);
        assert!(resolution.set.is_none());

        let default = create_set(&f.db, "House style", true).await;
        let resolution = f.resolver.resolve_with_source(ResourceRef::media(42)).await.unwrap();
        assert_eq!(resolution.source, ResolutionSource::Default);
        assert_eq!(resolution.set.unwrap().id, default);

        // A disabled default is never used
        f.db.update_set(
            default,
            &WatermarkSetUpdate {
                enabled: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(f
            .resolver
            .resolve_effective_watermark_set(ResourceRef::item_set(2))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_assigned_set_is_returned_even_when_disabled() {
        let f = fixture().await;
        let holiday = create_set(&f.db, "Holiday", false).await;
        f.resolver
            .set_assignment(ResourceRef::media(42), AssignmentTarget::Set(holiday))
            .await
            .unwrap();
        f.db.update_set(
            holiday,
            &WatermarkSetUpdate {
                enabled: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let set = f
            .resolver
            .resolve_effective_watermark_set(ResourceRef::media(42))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(set.id, holiday);
        assert!(!set.enabled);
    }

    #[tokio::test]
    async fn test_deleted_set_falls_back_to_inheritance() {
        let f = fixture().await;
        let doomed = create_set(&f.db, "Doomed", false).await;
        let default = create_set(&f.db, "Default", true).await;
        f.resolver
            .set_assignment(ResourceRef::media(42), AssignmentTarget::Set(doomed))
            .await
            .unwrap();

        f.db.delete_set(doomed).await.unwrap();

        let resolution = f.resolver.resolve_with_source(ResourceRef::media(42)).await.unwrap();
        assert_eq!(resolution.source, ResolutionSource::Default);
        assert_eq!(resolution.set.unwrap().id, default);
    }

    #[tokio::test]
    async fn test_set_assignment_validation() {
        let f = fixture().await;

        let err = f
            .resolver
            .set_assignment(ResourceRef::media(42), AssignmentTarget::Set(999))
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "invalid_assignment");

        let mut disabled = NewWatermarkSet::new("Off");
        disabled.enabled = false;
        let disabled = f.db.create_set(&disabled).await.unwrap();
        let err = f
            .resolver
            .set_assignment(ResourceRef::media(42), AssignmentTarget::Set(disabled.id))
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "invalid_assignment");
        assert!(f
            .resolver
            .get_assignment(ResourceRef::media(42))
            .await
            .unwrap()
            .is_none());

        let err = f
            .resolver
            .set_assignment(ResourceRef::media(404), AssignmentTarget::NoWatermark)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WatermarkError::ResourceNotFound { resource } if resource == ResourceRef::media(404)
        ));

        let err = f
            .resolver
            .resolve_effective_watermark_set(ResourceRef::item(404))
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "resource_not_found");
    }

    #[tokio::test]
    async fn test_default_target_drops_override() {
        let f = fixture().await;
        let media = ResourceRef::media(42);

        // Dropping a missing override is a no-op
        assert!(f
            .resolver
            .set_assignment(media, AssignmentTarget::Default)
            .await
            .unwrap()
            .is_none());

        let row = f
            .resolver
            .set_assignment(media, AssignmentTarget::NoWatermark)
            .await
            .unwrap()
            .unwrap();
        assert!(row.explicitly_no_watermark);
        assert_eq!(row.watermark_set_id, None);

        f.resolver
            .set_assignment(media, AssignmentTarget::Default)
            .await
            .unwrap();
        assert!(f.resolver.get_assignment(media).await.unwrap().is_none());
        assert_eq!(
            f.resolver.resolve_with_source(media).await.unwrap().source,
            ResolutionSource::Unassigned
        );
    }

    #[tokio::test]
    async fn test_switching_from_none_to_set_clears_flag() {
        let f = fixture().await;
        let holiday = create_set(&f.db, "Holiday", false).await;
        let media = ResourceRef::media(7);

        f.resolver
            .set_assignment(media, AssignmentTarget::NoWatermark)
            .await
            .unwrap();
        let row = f
            .resolver
            .set_assignment(media, AssignmentTarget::Set(holiday))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(row.watermark_set_id, Some(holiday));
        assert!(!row.explicitly_no_watermark);
    }
}
