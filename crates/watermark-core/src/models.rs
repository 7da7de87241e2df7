//! Core data models for watermark sets, settings and resource assignments

use crate::error::{Result, WatermarkError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a watermark set
pub type SetId = i64;

/// Identifier of a watermark setting
pub type SettingId = i64;

/// Identifier of an item, item set or media in the resource catalog
pub type ResourceId = i64;

/// Kinds of resources that can carry a watermark assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Item,
    ItemSet,
    Media,
}

impl ResourceType {
    /// Stable string form used in storage and on the command line
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Item => "item",
            ResourceType::ItemSet => "item_set",
            ResourceType::Media => "media",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = WatermarkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "item" => Ok(ResourceType::Item),
            "item_set" => Ok(ResourceType::ItemSet),
            "media" => Ok(ResourceType::Media),
            other => Err(WatermarkError::invalid_argument(format!(
                "unknown resource type '{}' (expected item, item_set or media)",
                other
            ))),
        }
    }
}

/// Reference to a single resource in the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    pub id: ResourceId,
}

impl ResourceRef {
    pub fn new(resource_type: ResourceType, id: ResourceId) -> Self {
        Self { resource_type, id }
    }

    pub fn item(id: ResourceId) -> Self {
        Self::new(ResourceType::Item, id)
    }

    pub fn item_set(id: ResourceId) -> Self {
        Self::new(ResourceType::ItemSet, id)
    }

    pub fn media(id: ResourceId) -> Self {
        Self::new(ResourceType::Media, id)
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{}", self.resource_type, self.id)
    }
}

/// Orientation of a concrete image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Landscape,
    Portrait,
    Square,
}

impl Orientation {
    /// Classify an image by comparing its width and height
    pub fn classify(width: u32, height: u32) -> Self {
        if width > height {
            Orientation::Landscape
        } else if height > width {
            Orientation::Portrait
        } else {
            Orientation::Square
        }
    }
}

/// Which images a watermark setting targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrientationType {
    All,
    Landscape,
    Portrait,
    Square,
}

impl OrientationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrientationType::All => "all",
            OrientationType::Landscape => "landscape",
            OrientationType::Portrait => "portrait",
            OrientationType::Square => "square",
        }
    }
}

impl From<Orientation> for OrientationType {
    fn from(orientation: Orientation) -> Self {
        match orientation {
            Orientation::Landscape => OrientationType::Landscape,
            Orientation::Portrait => OrientationType::Portrait,
            Orientation::Square => OrientationType::Square,
        }
    }
}

impl fmt::Display for OrientationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrientationType {
    type Err = WatermarkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(OrientationType::All),
            "landscape" => Ok(OrientationType::Landscape),
            "portrait" => Ok(OrientationType::Portrait),
            "square" => Ok(OrientationType::Square),
            other => Err(WatermarkError::invalid_argument(format!(
                "unknown watermark type '{}' (expected all, landscape, portrait or square)",
                other
            ))),
        }
    }
}

/// Watermark positioning options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WatermarkPosition {
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
    Center,
    /// Stretched across the full width, flush with the bottom edge
    BottomFull,
}

impl WatermarkPosition {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatermarkPosition::TopLeft => "top-left",
            WatermarkPosition::TopRight => "top-right",
            WatermarkPosition::BottomLeft => "bottom-left",
            WatermarkPosition::BottomRight => "bottom-right",
            WatermarkPosition::Center => "center",
            WatermarkPosition::BottomFull => "bottom-full",
        }
    }
}

impl Default for WatermarkPosition {
    fn default() -> Self {
        WatermarkPosition::BottomRight
    }
}

impl fmt::Display for WatermarkPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WatermarkPosition {
    type Err = WatermarkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "top-left" => Ok(WatermarkPosition::TopLeft),
            "top-right" => Ok(WatermarkPosition::TopRight),
            "bottom-left" => Ok(WatermarkPosition::BottomLeft),
            "bottom-right" => Ok(WatermarkPosition::BottomRight),
            "center" | "centre" => Ok(WatermarkPosition::Center),
            "bottom-full" => Ok(WatermarkPosition::BottomFull),
            other => Err(WatermarkError::invalid_argument(format!(
                "unknown watermark position '{}'",
                other
            ))),
        }
    }
}

/// Reject opacities outside [0.0, 1.0]; both bounds are valid
pub fn validate_opacity(opacity: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&opacity) {
        return Err(WatermarkError::invalid_argument(format!(
            "opacity {} must be between 0.0 and 1.0",
            opacity
        )));
    }
    Ok(())
}

/// A named collection of watermark placements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatermarkSet {
    pub id: SetId,
    pub name: String,
    pub is_default: bool,
    pub enabled: bool,
    pub settings: Vec<WatermarkSetting>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

impl WatermarkSet {
    /// Pick the setting to use for an image of the given orientation.
    ///
    /// First exact orientation match, then the first `all` setting, then
    /// whatever comes first in the set.
    pub fn select_setting(&self, orientation: Orientation) -> Option<&WatermarkSetting> {
        let wanted = OrientationType::from(orientation);
        self.settings
            .iter()
            .find(|s| s.orientation_type == wanted)
            .or_else(|| {
                self.settings
                    .iter()
                    .find(|s| s.orientation_type == OrientationType::All)
            })
            .or_else(|| self.settings.first())
    }
}

/// One placement rule inside a watermark set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatermarkSetting {
    pub id: SettingId,
    pub set_id: SetId,
    #[serde(rename = "type")]
    pub orientation_type: OrientationType,
    pub position: WatermarkPosition,
    pub opacity: f32,
    /// Storage-relative reference to the overlay image
    pub image_ref: String,
    pub created: DateTime<Utc>,
}

/// Input for creating a watermark set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWatermarkSet {
    pub name: String,
    pub is_default: bool,
    pub enabled: bool,
}

impl NewWatermarkSet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_default: false,
            enabled: true,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(WatermarkError::invalid_argument(
                "watermark set name must not be empty",
            ));
        }
        Ok(())
    }
}

/// Partial update of a watermark set
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatermarkSetUpdate {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub is_default: Option<bool>,
}

/// Input for adding a setting to a watermark set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWatermarkSetting {
    pub orientation_type: OrientationType,
    pub position: WatermarkPosition,
    pub opacity: f32,
    pub image_ref: String,
}

impl NewWatermarkSetting {
    pub fn validate(&self) -> Result<()> {
        validate_opacity(self.opacity)?;
        if self.image_ref.trim().is_empty() {
            return Err(WatermarkError::invalid_argument(
                "watermark image reference must not be empty",
            ));
        }
        Ok(())
    }
}

/// Partial update of a watermark setting
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatermarkSettingUpdate {
    pub orientation_type: Option<OrientationType>,
    pub position: Option<WatermarkPosition>,
    pub opacity: Option<f32>,
    pub image_ref: Option<String>,
}

impl WatermarkSettingUpdate {
    pub fn validate(&self) -> Result<()> {
        if let Some(opacity) = self.opacity {
            validate_opacity(opacity)?;
        }
        if matches!(&self.image_ref, Some(r) if r.trim().is_empty()) {
            return Err(WatermarkError::invalid_argument(
                "watermark image reference must not be empty",
            ));
        }
        Ok(())
    }
}

/// A resource's explicit override of inherited watermarking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceAssignment {
    pub resource: ResourceRef,
    pub watermark_set_id: Option<SetId>,
    pub explicitly_no_watermark: bool,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

impl ResourceAssignment {
    /// A row may point at a set or opt out, never both
    pub fn validate(&self) -> Result<()> {
        validate_assignment_row(self.watermark_set_id, self.explicitly_no_watermark)
    }
}

pub(crate) fn validate_assignment_row(
    watermark_set_id: Option<SetId>,
    explicitly_no_watermark: bool,
) -> Result<()> {
    if watermark_set_id.is_some() && explicitly_no_watermark {
        return Err(WatermarkError::invalid_assignment(
            "an assignment cannot reference a watermark set and opt out of watermarking at once",
        ));
    }
    Ok(())
}

/// What an assignment request asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentTarget {
    /// Use this watermark set
    Set(SetId),
    /// Never watermark this resource
    NoWatermark,
    /// Drop the override and inherit again
    Default,
}

impl FromStr for AssignmentTarget {
    type Err = WatermarkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(AssignmentTarget::NoWatermark),
            "default" => Ok(AssignmentTarget::Default),
            other => other.parse::<SetId>().map(AssignmentTarget::Set).map_err(|_| {
                WatermarkError::invalid_argument(format!(
                    "assignment target '{}' must be a watermark set id, 'none' or 'default'",
                    other
                ))
            }),
        }
    }
}

/// Stored file behind a media resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFile {
    pub media_id: ResourceId,
    pub item_id: ResourceId,
    /// File name shared by all renditions of this media
    pub storage_id: String,
    pub media_type: String,
}

/// The event that asked for watermarking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Upload,
    Import,
    Manual,
}

impl FromStr for Trigger {
    type Err = WatermarkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "upload" => Ok(Trigger::Upload),
            "import" => Ok(Trigger::Import),
            "manual" => Ok(Trigger::Manual),
            other => Err(WatermarkError::invalid_argument(format!(
                "unknown trigger '{}'",
                other
            ))),
        }
    }
}

/// Outcome for a single derivative rendition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DerivativeOutcome {
    Watermarked {
        setting_id: SettingId,
        position: WatermarkPosition,
    },
    Skipped {
        reason: String,
    },
    Failed {
        error_type: String,
        message: String,
    },
}

/// Result of watermarking one derivative
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivativeReport {
    pub derivative: String,
    pub outcome: DerivativeOutcome,
}

/// Result of watermarking one media
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaReport {
    pub media_id: ResourceId,
    pub watermark_set_id: Option<SetId>,
    /// Set when the media was skipped as a whole
    pub skipped: Option<String>,
    pub derivatives: Vec<DerivativeReport>,
}

impl MediaReport {
    pub(crate) fn skipped(media_id: ResourceId, reason: impl Into<String>) -> Self {
        Self {
            media_id,
            watermark_set_id: None,
            skipped: Some(reason.into()),
            derivatives: Vec::new(),
        }
    }

    pub fn watermarked_count(&self) -> usize {
        self.derivatives
            .iter()
            .filter(|d| matches!(d.outcome, DerivativeOutcome::Watermarked { .. }))
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.derivatives
            .iter()
            .filter(|d| matches!(d.outcome, DerivativeOutcome::Failed { .. }))
            .count()
    }
}

/// A failure recorded during a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub media_id: ResourceId,
    /// `None` when the media failed as a whole
    pub derivative: Option<String>,
    pub error_type: String,
    pub message: String,
}

/// Tally of a sequential batch run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Media looked at
    pub processed: usize,
    /// Derivatives that received a watermark
    pub watermarked: usize,
    /// Media skipped as a whole
    pub skipped: usize,
    /// Failed derivatives plus media that failed as a whole
    pub failed: usize,
    pub failures: Vec<BatchFailure>,
}
