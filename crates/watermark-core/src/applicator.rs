//! Applies the effective watermark set to a media's derivative renditions

use crate::codec::{self, DecodedImage, ImageFormat};
use crate::compositor::Compositor;
use crate::config::{AppConfig, WatermarkingSettings};
use crate::error::{Result, WatermarkError};
use crate::models::{
    BatchFailure, BatchSummary, DerivativeOutcome, DerivativeReport, MediaFile, MediaReport,
    Orientation, ResourceId, ResourceRef, Trigger, WatermarkSet,
};
use crate::resolver::AssignmentResolver;
use crate::storage::{FileStore, MediaStorage};
use crate::store::{ResourceLookup, WatermarkStore};
use image::DynamicImage;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Decoded watermark images keyed by their storage reference, kept for one
/// media so every derivative reuses the same decode
type AssetCache = HashMap<String, Arc<DynamicImage>>;

/// Encodes a composited derivative back into its stored format
pub type Encoder = fn(&DynamicImage, ImageFormat) -> Result<Vec<u8>>;

/// Watermarks derivative renditions of media
pub struct WatermarkApplicator {
    settings: WatermarkingSettings,
    derivatives: Vec<String>,
    resolver: AssignmentResolver,
    resources: Arc<dyn ResourceLookup>,
    storage: Arc<dyn MediaStorage>,
    compositor: Compositor,
    encoder: Encoder,
}

impl WatermarkApplicator {
    pub fn new(
        settings: WatermarkingSettings,
        derivatives: Vec<String>,
        resolver: AssignmentResolver,
        resources: Arc<dyn ResourceLookup>,
        storage: Arc<dyn MediaStorage>,
    ) -> Self {
        Self {
            settings,
            derivatives,
            resolver,
            resources,
            storage,
            compositor: Compositor::new(),
            encoder: codec::encode,
        }
    }

    /// Use a different encoder for rewritten derivatives
    pub fn with_encoder(mut self, encoder: Encoder) -> Self {
        self.encoder = encoder;
        self
    }

    /// Wire an applicator from configuration around one store that also
    /// serves the resource catalog
    pub fn from_config<S>(config: &AppConfig, store: Arc<S>) -> Self
    where
        S: WatermarkStore + ResourceLookup + 'static,
    {
        let resolver = AssignmentResolver::new(store.clone(), store.clone());
        Self::new(
            config.watermarking.clone(),
            config.storage.derivatives.clone(),
            resolver,
            store,
            Arc::new(FileStore::new(&config.storage.files_root)),
        )
    }

    pub fn resolver(&self) -> &AssignmentResolver {
        &self.resolver
    }

    /// Watermark every configured derivative of one media.
    ///
    /// Per-derivative problems end up in the report; only errors that are
    /// not local to this media are returned.
    #[instrument(skip(self))]
    pub async fn apply_to_media(&self, media_id: ResourceId, trigger: Trigger) -> Result<MediaReport> {
        if let Some(reason) = self.trigger_gate(trigger) {
            debug!("Skipping media {}: {}", media_id, reason);
            return Ok(MediaReport::skipped(media_id, reason));
        }

        let resource = ResourceRef::media(media_id);
        let media = self
            .resources
            .media_file(media_id)
            .await?
            .ok_or(WatermarkError::ResourceNotFound { resource })?;

        if !self.settings.supports(&media.media_type) {
            let reason = format!("media type {} is not watermarked", media.media_type);
            debug!("Skipping media {}: {}", media_id, reason);
            return Ok(MediaReport::skipped(media_id, reason));
        }

        let set = match self.resolver.resolve_effective_watermark_set(resource).await? {
            Some(set) if set.enabled => set,
            Some(set) => {
                let reason = format!("watermark set {} is disabled", set.id);
                debug!("Skipping media {}: {}", media_id, reason);
                return Ok(MediaReport::skipped(media_id, reason));
            }
            None => {
                debug!("Skipping media {}: no watermark set applies", media_id);
                return Ok(MediaReport::skipped(media_id, "no watermark set applies"));
            }
        };

        let mut report = MediaReport {
            media_id,
            watermark_set_id: Some(set.id),
            skipped: None,
            derivatives: Vec::with_capacity(self.derivatives.len()),
        };
        let mut assets = AssetCache::new();

        for derivative in &self.derivatives {
            let outcome = match self
                .apply_to_derivative(&set, &media, derivative, &mut assets)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) if e.is_item_local() => {
                    warn!(
                        media_id,
                        derivative = %derivative,
                        error = %e,
                        "Failed to watermark derivative"
                    );
                    DerivativeOutcome::Failed {
                        error_type: e.error_type().to_string(),
                        message: e.to_string(),
                    }
                }
                Err(e) => return Err(e),
            };
            report.derivatives.push(DerivativeReport {
                derivative: derivative.clone(),
                outcome,
            });
        }

        info!(
            media_id,
            set_id = set.id,
            watermarked = report.watermarked_count(),
            failed = report.failed_count(),
            "Watermarking finished"
        );
        Ok(report)
    }

    /// Run [`apply_to_media`](Self::apply_to_media) for each id in order.
    ///
    /// A media that fails on its own is recorded and the batch moves on.
    #[instrument(skip(self, media_ids), fields(count = media_ids.len()))]
    pub async fn apply_batch(
        &self,
        media_ids: &[ResourceId],
        trigger: Trigger,
    ) -> Result<BatchSummary> {
        let mut summary = BatchSummary::default();

        for &media_id in media_ids {
            summary.processed += 1;

            match self.apply_to_media(media_id, trigger).await {
                Ok(report) => {
                    if report.skipped.is_some() {
                        summary.skipped += 1;
                    }
                    summary.watermarked += report.watermarked_count();
                    for derivative in report.derivatives {
                        if let DerivativeOutcome::Failed {
                            error_type,
                            message,
                        } = derivative.outcome
                        {
                            summary.failed += 1;
                            summary.failures.push(BatchFailure {
                                media_id,
                                derivative: Some(derivative.derivative),
                                error_type,
                                message,
                            });
                        }
                    }
                }
                Err(e) if e.is_item_local() => {
                    warn!(media_id, error = %e, "Failed to watermark media");
                    summary.failed += 1;
                    summary.failures.push(BatchFailure {
                        media_id,
                        derivative: None,
                        error_type: e.error_type().to_string(),
                        message: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            processed = summary.processed,
            watermarked = summary.watermarked,
            skipped = summary.skipped,
            failed = summary.failed,
            "Batch finished"
        );
        Ok(summary)
    }

    /// Why this trigger does not watermark at all, if it doesn't
    fn trigger_gate(&self, trigger: Trigger) -> Option<&'static str> {
        if !self.settings.enabled {
            return Some("watermarking is disabled");
        }
        match trigger {
            Trigger::Upload if !self.settings.apply_on_upload => {
                Some("watermarking on upload is disabled")
            }
            Trigger::Import if !self.settings.apply_on_import => {
                Some("watermarking on import is disabled")
            }
            _ => None,
        }
    }

    async fn apply_to_derivative(
        &self,
        set: &WatermarkSet,
        media: &MediaFile,
        derivative: &str,
        assets: &mut AssetCache,
    ) -> Result<DerivativeOutcome> {
        let bytes = match self.storage.read_derivative(derivative, &media.storage_id).await {
            Ok(bytes) => bytes,
            Err(WatermarkError::Storage { path }) => {
                debug!("No {} derivative at {}", derivative, path.display());
                return Ok(DerivativeOutcome::Skipped {
                    reason: "derivative file not found".to_string(),
                });
            }
            Err(e) => return Err(e),
        };

        let base: DecodedImage = run_blocking(move || codec::decode(&bytes)).await?;
        let orientation = Orientation::classify(base.image.width(), base.image.height());

        let Some(setting) = set.select_setting(orientation) else {
            return Ok(DerivativeOutcome::Skipped {
                reason: format!("watermark set {} has no settings", set.id),
            });
        };

        let watermark = self.load_asset(&setting.image_ref, assets).await?;
        let (position, opacity) = (setting.position, setting.opacity);
        let (compositor, encoder) = (self.compositor.clone(), self.encoder);

        // Nothing is written unless encoding succeeds
        let encoded = run_blocking(move || {
            let composited = compositor.composite(&base.image, &watermark, position, opacity)?;
            encoder(&composited, base.format)
        })
        .await?;

        self.storage
            .replace_derivative(derivative, &media.storage_id, encoded)
            .await?;

        debug!(
            media_id = media.media_id,
            derivative,
            setting_id = setting.id,
            orientation = ?orientation,
            "Watermarked derivative"
        );
        Ok(DerivativeOutcome::Watermarked {
            setting_id: setting.id,
            position,
        })
    }

    async fn load_asset(&self, image_ref: &str, assets: &mut AssetCache) -> Result<Arc<DynamicImage>> {
        if let Some(cached) = assets.get(image_ref) {
            return Ok(cached.clone());
        }

        let bytes = self.storage.read_asset(image_ref).await?;
        let decoded = run_blocking(move || codec::decode(&bytes)).await?;
        let image = Arc::new(decoded.image);
        assets.insert(image_ref.to_string(), image.clone());
        Ok(image)
    }
}

/// Run pixel work off the async executor
async fn run_blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| WatermarkError::Io(std::io::Error::other(e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::database::DatabaseManager;
    use crate::models::{
        AssignmentTarget, NewWatermarkSet, NewWatermarkSetting, OrientationType,
        WatermarkPosition, WatermarkSetUpdate,
    };
    use image::{Rgb, RgbImage, Rgba, RgbaImage};
    use std::path::Path;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        db: Arc<DatabaseManager>,
        config: AppConfig,
    }

    impl Fixture {
        fn applicator(&self) -> WatermarkApplicator {
            WatermarkApplicator::from_config(&self.config, self.db.clone())
        }

        fn files(&self) -> &Path {
            &self.config.storage.files_root
        }

        fn write_derivative(
            &self,
            derivative: &str,
            storage_id: &str,
            image: &DynamicImage,
            format: ImageFormat,
        ) {
            let dir = self.files().join(derivative);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join(storage_id), codec::encode(image, format).unwrap()).unwrap();
        }

        fn read_derivative(&self, derivative: &str, storage_id: &str) -> DecodedImage {
            let bytes = std::fs::read(self.files().join(derivative).join(storage_id)).unwrap();
            codec::decode(&bytes).unwrap()
        }
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.database = DatabaseConfig {
            database_url: format!("sqlite:{}", dir.path().join("test.db").display()),
            ..Default::default()
        };
        config.storage.files_root = dir.path().join("files");

        let db = Arc::new(DatabaseManager::new(&config.database).await.unwrap());
        db.register_item_set(2, "Summer").await.unwrap();
        db.register_item(5, "Beach").await.unwrap();
        db.link_item_to_set(5, 2).await.unwrap();

        // Opaque white watermark
        let watermark_dir = config.storage.files_root.join("watermarks");
        std::fs::create_dir_all(&watermark_dir).unwrap();
        let logo = DynamicImage::ImageRgba8(RgbaImage::from_pixel(8, 4, Rgba([255, 255, 255, 255])));
        std::fs::write(
            watermark_dir.join("logo.png"),
            codec::encode(&logo, ImageFormat::Png).unwrap(),
        )
        .unwrap();

        Fixture {
            _dir: dir,
            db,
            config,
        }
    }

    async fn holiday_set(db: &DatabaseManager, position: WatermarkPosition) -> crate::models::SetId {
        let set = db.create_set(&NewWatermarkSet::new("Holiday")).await.unwrap();
        db.add_setting(
            set.id,
            &NewWatermarkSetting {
                orientation_type: OrientationType::All,
                position,
                opacity: 1.0,
                image_ref: "watermarks/logo.png".to_string(),
            },
        )
        .await
        .unwrap();
        set.id
    }

    fn black_rgb(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([0, 0, 0])))
    }

    #[tokio::test]
    async fn test_jpeg_derivatives_are_watermarked_in_place() {
        let f = fixture().await;
        f.db.register_media(42, 5, "beach.jpg", "image/jpeg").await.unwrap();
        let set_id = holiday_set(&f.db, WatermarkPosition::TopLeft).await;
        f.db.upsert_assignment(ResourceRef::item_set(2), Some(set_id), false)
            .await
            .unwrap();

        f.write_derivative("large", "beach.jpg", &black_rgb(120, 80), ImageFormat::Jpeg);
        f.write_derivative("medium", "beach.jpg", &black_rgb(60, 40), ImageFormat::Jpeg);

        let report = f.applicator().apply_to_media(42, Trigger::Upload).await.unwrap();
        assert_eq!(report.watermark_set_id, Some(set_id));
        assert_eq!(report.watermarked_count(), 2);
        assert_eq!(report.failed_count(), 0);

        let large = f.read_derivative("large", "beach.jpg");
        assert_eq!(large.format, ImageFormat::Jpeg);
        assert_eq!((large.image.width(), large.image.height()), (120, 80));
        let rgb = large.image.to_rgb8();
        assert!(rgb.get_pixel(12, 11)[0] > 200, "watermark missing");
        assert!(rgb.get_pixel(100, 70)[0] < 50, "base overwritten");
    }

    #[tokio::test]
    async fn test_png_alpha_survives() {
        let f = fixture().await;
        f.db.register_media(8, 5, "cutout.png", "image/png").await.unwrap();
        let set_id = holiday_set(&f.db, WatermarkPosition::Center).await;
        f.db.upsert_assignment(ResourceRef::media(8), Some(set_id), false)
            .await
            .unwrap();

        let transparent = DynamicImage::ImageRgba8(RgbaImage::from_pixel(40, 40, Rgba([0, 0, 0, 0])));
        f.write_derivative("large", "cutout.png", &transparent, ImageFormat::Png);

        let report = f.applicator().apply_to_media(8, Trigger::Manual).await.unwrap();
        assert_eq!(report.watermarked_count(), 1);
        // medium was never written
        assert!(matches!(
            report.derivatives[1].outcome,
            DerivativeOutcome::Skipped { .. }
        ));

        let large = f.read_derivative("large", "cutout.png");
        assert_eq!(large.format, ImageFormat::Png);
        assert!(large.image.color().has_alpha());
        let rgba = large.image.to_rgba8();
        assert_eq!(rgba.get_pixel(0, 0)[3], 0);
        assert_eq!(rgba.get_pixel(20, 20)[3], 255);
    }

    #[tokio::test]
    async fn test_skips_without_touching_files() {
        let f = fixture().await;
        f.db.register_media(42, 5, "beach.jpg", "image/jpeg").await.unwrap();
        f.db.register_media(43, 5, "clip.mp4", "video/mp4").await.unwrap();
        f.write_derivative("large", "beach.jpg", &black_rgb(30, 30), ImageFormat::Jpeg);
        let before = std::fs::read(f.files().join("large").join("beach.jpg")).unwrap();

        // Nothing assigned and no default
        let report = f.applicator().apply_to_media(42, Trigger::Upload).await.unwrap();
        assert_eq!(report.skipped.as_deref(), Some("no watermark set applies"));

        let set_id = holiday_set(&f.db, WatermarkPosition::Center).await;
        f.db.set_default(set_id).await.unwrap();

        let report = f.applicator().apply_to_media(43, Trigger::Upload).await.unwrap();
        assert!(report.skipped.unwrap().contains("video/mp4"));

        let mut config = f.config.clone();
        config.watermarking.apply_on_import = false;
        let applicator = WatermarkApplicator::from_config(&config, f.db.clone());
        let report = applicator.apply_to_media(42, Trigger::Import).await.unwrap();
        assert!(report.skipped.is_some());

        config.watermarking.enabled = false;
        let applicator = WatermarkApplicator::from_config(&config, f.db.clone());
        let report = applicator.apply_to_media(42, Trigger::Manual).await.unwrap();
        assert_eq!(report.skipped.as_deref(), Some("watermarking is disabled"));

        let applicator = f.applicator();
        applicator
            .resolver()
            .set_assignment(ResourceRef::media(42), AssignmentTarget::NoWatermark)
            .await
            .unwrap();
        let report = applicator.apply_to_media(42, Trigger::Upload).await.unwrap();
        assert!(report.skipped.is_some());

        assert_eq!(std::fs::read(f.files().join("large").join("beach.jpg")).unwrap(), before);
    }

    #[tokio::test]
    async fn test_disabled_assigned_set_is_skipped() {
        let f = fixture().await;
        f.db.register_media(42, 5, "beach.jpg", "image/jpeg").await.unwrap();
        let set_id = holiday_set(&f.db, WatermarkPosition::Center).await;
        f.db.upsert_assignment(ResourceRef::item(5), Some(set_id), false)
            .await
            .unwrap();
        f.db.update_set(
            set_id,
            &WatermarkSetUpdate {
                enabled: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let report = f.applicator().apply_to_media(42, Trigger::Upload).await.unwrap();
        assert!(report.skipped.unwrap().contains("disabled"));
    }

    #[tokio::test]
    async fn test_batch_continues_after_undecodable_derivative() {
        let f = fixture().await;
        let set_id = holiday_set(&f.db, WatermarkPosition::BottomFull).await;
        f.db.set_default(set_id).await.unwrap();

        f.db.register_media(1, 5, "broken.jpg", "image/jpeg").await.unwrap();
        f.db.register_media(2, 5, "fine.jpg", "image/jpeg").await.unwrap();
        std::fs::create_dir_all(f.files().join("large")).unwrap();
        std::fs::write(f.files().join("large").join("broken.jpg"), b"not a jpeg").unwrap();
        f.write_derivative("large", "fine.jpg", &black_rgb(64, 48), ImageFormat::Jpeg);

        let summary = f
            .applicator()
            .apply_batch(&[1, 2, 999], Trigger::Manual)
            .await
            .unwrap();

        assert_eq!(summary.processed, 3);
        assert_eq!(summary.watermarked, 1);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.failures[0].media_id, 1);
        assert_eq!(summary.failures[0].derivative.as_deref(), Some("large"));
        assert_eq!(summary.failures[0].error_type, "image_decode_error");
        assert_eq!(summary.failures[1].media_id, 999);
        assert_eq!(summary.failures[1].error_type, "resource_not_found");

        // The broken file is left as it was
        assert_eq!(
            std::fs::read(f.files().join("large").join("broken.jpg")).unwrap(),
            b"not a jpeg"
        );
    }

    /// File storage that counts how often a derivative is replaced
    struct CountingStorage {
        inner: FileStore,
        replaced: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl MediaStorage for CountingStorage {
        async fn read_derivative(&self, derivative: &str, storage_id: &str) -> Result<Vec<u8>> {
            self.inner.read_derivative(derivative, storage_id).await
        }

        async fn replace_derivative(
            &self,
            derivative: &str,
            storage_id: &str,
            bytes: Vec<u8>,
        ) -> Result<()> {
            self.replaced.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.inner.replace_derivative(derivative, storage_id, bytes).await
        }

        async fn read_asset(&self, image_ref: &str) -> Result<Vec<u8>> {
            self.inner.read_asset(image_ref).await
        }
    }

    fn failing_encoder(_: &DynamicImage, format: ImageFormat) -> Result<Vec<u8>> {
        Err(WatermarkError::ImageEncode {
            message: format!("cannot write {}", format.mime_type()),
        })
    }

    #[tokio::test]
    async fn test_encode_failure_leaves_derivative_untouched() {
        let f = fixture().await;
        f.db.register_media(42, 5, "beach.jpg", "image/jpeg").await.unwrap();
        let set_id = holiday_set(&f.db, WatermarkPosition::Center).await;
        f.db.set_default(set_id).await.unwrap();
        f.write_derivative("large", "beach.jpg", &black_rgb(40, 30), ImageFormat::Jpeg);
        let before = std::fs::read(f.files().join("large").join("beach.jpg")).unwrap();

        let storage = Arc::new(CountingStorage {
            inner: FileStore::new(f.files()),
            replaced: Default::default(),
        });
        let applicator = WatermarkApplicator::new(
            f.config.watermarking.clone(),
            vec!["large".to_string()],
            AssignmentResolver::new(f.db.clone(), f.db.clone()),
            f.db.clone(),
            storage.clone(),
        )
        .with_encoder(failing_encoder);

        let report = applicator.apply_to_media(42, Trigger::Manual).await.unwrap();
        assert_eq!(report.failed_count(), 1);
        match &report.derivatives[0].outcome {
            DerivativeOutcome::Failed { error_type, .. } => {
                assert_eq!(error_type, "image_encode_error")
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        assert_eq!(storage.replaced.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(std::fs::read(f.files().join("large").join("beach.jpg")).unwrap(), before);
        // No stray temporary files
        assert_eq!(std::fs::read_dir(f.files().join("large")).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_missing_watermark_asset_fails_derivative() {
        let f = fixture().await;
        f.db.register_media(42, 5, "beach.jpg", "image/jpeg").await.unwrap();
        let set = f.db.create_set(&NewWatermarkSet::new("Ghost")).await.unwrap();
        f.db.add_setting(
            set.id,
            &NewWatermarkSetting {
                orientation_type: OrientationType::Landscape,
                position: WatermarkPosition::BottomRight,
                opacity: 0.5,
                image_ref: "watermarks/missing.png".to_string(),
            },
        )
        .await
        .unwrap();
        f.db.upsert_assignment(ResourceRef::media(42), Some(set.id), false)
            .await
            .unwrap();
        f.write_derivative("large", "beach.jpg", &black_rgb(50, 30), ImageFormat::Jpeg);

        let report = f.applicator().apply_to_media(42, Trigger::Upload).await.unwrap();
        assert_eq!(report.failed_count(), 1);
        match &report.derivatives[0].outcome {
            DerivativeOutcome::Failed { error_type, .. } => assert_eq!(error_type, "storage_error"),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_set_skips_derivatives() {
        let f = fixture().await;
        f.db.register_media(42, 5, "beach.jpg", "image/jpeg").await.unwrap();
        let set = f.db.create_set(&NewWatermarkSet::new("Empty")).await.unwrap();
        f.db.upsert_assignment(ResourceRef::media(42), Some(set.id), false)
            .await
            .unwrap();
        f.write_derivative("large", "beach.jpg", &black_rgb(50, 30), ImageFormat::Jpeg);

        let report = f.applicator().apply_to_media(42, Trigger::Upload).await.unwrap();
        assert_eq!(report.watermarked_count(), 0);
        assert!(report
            .derivatives
            .iter()
            .all(|d| matches!(d.outcome, DerivativeOutcome::Skipped { .. })));
    }
}
