//! Persistence and catalog seams consumed by the resolver and applicator

use crate::error::Result;
use crate::models::{
    MediaFile, NewWatermarkSet, NewWatermarkSetting, ResourceAssignment, ResourceId,
    ResourceRef, SetId, SettingId, WatermarkSet, WatermarkSetUpdate, WatermarkSetting,
    WatermarkSettingUpdate,
};
use async_trait::async_trait;

/// Read access to the resource catalog
#[async_trait]
pub trait ResourceLookup: Send + Sync {
    /// Whether the resource exists
    async fn exists(&self, resource: ResourceRef) -> Result<bool>;

    /// Direct parents used for inheritance.
    ///
    /// Media yield their owning item, items yield their item sets in
    /// ascending id order, item sets yield nothing.
    async fn parents(&self, resource: ResourceRef) -> Result<Vec<ResourceRef>>;

    /// Stored file details of a media
    async fn media_file(&self, media_id: ResourceId) -> Result<Option<MediaFile>>;
}

/// Persistence for watermark sets, settings and assignments.
///
/// Implementations enforce the data invariants at this boundary: opacity in
/// range, at most one default set, no assignment that both names a set and
/// opts out.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn create_set(&self, new_set: &NewWatermarkSet) -> Result<WatermarkSet>;

    async fn update_set(&self, id: SetId, update: &WatermarkSetUpdate) -> Result<WatermarkSet>;

    /// Make this set the only default, clearing the flag everywhere else
    async fn set_default(&self, id: SetId) -> Result<WatermarkSet>;

    /// Delete a set and its settings; assignments pointing at it are nulled.
    /// Returns `true` if a row was removed.
    async fn delete_set(&self, id: SetId) -> Result<bool>;

    async fn get_set(&self, id: SetId) -> Result<Option<WatermarkSet>>;

    async fn list_sets(&self) -> Result<Vec<WatermarkSet>>;

    /// The set flagged default, provided it is enabled
    async fn default_set(&self) -> Result<Option<WatermarkSet>>;

    async fn add_setting(
        &self,
        set_id: SetId,
        setting: &NewWatermarkSetting,
    ) -> Result<WatermarkSetting>;

    async fn update_setting(
        &self,
        id: SettingId,
        update: &WatermarkSettingUpdate,
    ) -> Result<WatermarkSetting>;

    async fn delete_setting(&self, id: SettingId) -> Result<bool>;

    async fn find_assignment(&self, resource: ResourceRef) -> Result<Option<ResourceAssignment>>;

    async fn upsert_assignment(
        &self,
        resource: ResourceRef,
        watermark_set_id: Option<SetId>,
        explicitly_no_watermark: bool,
    ) -> Result<ResourceAssignment>;

    /// Returns `true` if a row was removed
    async fn delete_assignment(&self, resource: ResourceRef) -> Result<bool>;
}
