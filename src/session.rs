//! High-level hologram acquisition session.
//!
//! [`HoloClient`] combines the protocol client with the measurement
//! procedures: exposure-optimized frames, OPL balancing, reference hologram
//! evaluation and the assembly of complete [`HoloRecord`]s.

use crate::config::{DhmConfig, ExposureConfig, OplConfig, ReferenceConfig};
use crate::data::hologram::{reference_fit, to_f64, ReferenceFit};
use crate::data::stats::{ImageStatistics, DEFAULT_CONTRAST_QUANTILE};
use crate::data::storage::HoloRecord;
use crate::error::DhmResult;
use crate::instrument::capabilities::{saturation_value, HoloCamera, OplMotor, StageController};
use crate::instrument::dhm::DhmClient;
use crate::metadata::{AcquisitionMetadata, HoloParameters, OplParameters, StagePosition};
use crate::procedures::exposure::ExposureOptimizer;
use crate::procedures::opl_scan::{MicroscopeProbe, OplScanResult, OplScanner};
use ndarray::Array2;
use tracing::{info, instrument};

/// Axes queried from the stage controller.
const STAGE_AXES: &str = "XYZ";

/// One acquisition session owning the DHM connection.
pub struct HoloClient {
    client: DhmClient,
    stage: Option<Box<dyn StageController>>,
    exposure: ExposureConfig,
    opl: OplConfig,
    reference: ReferenceConfig,
    last_scan: Option<OplScanResult>,
}

impl HoloClient {
    /// Connects to the server named in `config`.
    pub async fn connect(config: &DhmConfig) -> DhmResult<Self> {
        let client = DhmClient::connect(&config.server).await?;
        Ok(Self::new(client, config))
    }

    pub fn new(client: DhmClient, config: &DhmConfig) -> Self {
        Self {
            client,
            stage: None,
            exposure: config.exposure.clone(),
            opl: config.opl.clone(),
            reference: config.reference.clone(),
            last_scan: None,
        }
    }

    /// Adds a stage controller whose position is stored with every acquisition.
    pub fn with_stage(mut self, stage: Box<dyn StageController>) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn client(&mut self) -> &mut DhmClient {
        &mut self.client
    }

    pub fn last_scan(&self) -> Option<&OplScanResult> {
        self.last_scan.as_ref()
    }

    pub fn reference_config(&self) -> &ReferenceConfig {
        &self.reference
    }

    async fn stage_position(&self) -> DhmResult<Option<StagePosition>> {
        match &self.stage {
            Some(stage) => stage.position(STAGE_AXES).await.map(Some),
            None => Ok(None),
        }
    }

    /// Grabs a frame, by default after optimizing the exposure.
    ///
    /// Returns the number of frames the optimization needed, or `None` for a
    /// plain grab at the current shutter value.
    pub async fn get_image(&mut self, optimize: bool) -> DhmResult<(Array2<u16>, Option<usize>)> {
        if optimize {
            let result = ExposureOptimizer::from(&self.exposure)
                .optimize(&mut self.client)
                .await?;
            Ok((result.frame, Some(result.frames)))
        } else {
            Ok((self.client.grab_frame().await?, None))
        }
    }

    /// Balances the optical path lengths and leaves the motor at the optimum.
    #[instrument(skip(self))]
    pub async fn motor_scan(&mut self, start: Option<f64>) -> DhmResult<OplScanResult> {
        let scanner = OplScanner::new(self.opl.clone());
        let optimizer = ExposureOptimizer::from(&self.exposure);
        let mut probe = MicroscopeProbe::new(&mut self.client, optimizer, self.opl.blur);
        let result = scanner.scan(&mut probe, start).await?;
        info!(position = result.position, initial = ?result.initial, "OPL scan finished");
        self.last_scan = Some(result);
        Ok(result)
    }

    /// Evaluates a reference hologram.
    ///
    /// `blur` and `order` replace the configured values for this and later
    /// calls. Without `frame` a new one is grabbed at the current shutter.
    pub async fn ref_image(
        &mut self,
        blur: Option<usize>,
        order: Option<usize>,
        frame: Option<Array2<u16>>,
    ) -> DhmResult<ReferenceFit> {
        if let Some(blur) = blur {
            self.reference.blur = blur;
        }
        if let Some(order) = order {
            self.reference.order = order;
        }
        let frame = match frame {
            Some(frame) => frame,
            None => self.client.grab_frame().await?,
        };

        let mut fit = reference_fit(&to_f64(&frame), self.reference.blur, self.reference.order)?;
        let stage = self.stage_position().await?;
        let motor = self.client.motor_position().await?;
        let shutter = self.client.shutter().await?;
        fit.metadata = Some(AcquisitionMetadata::new(motor, shutter, stage));
        Ok(fit)
    }

    /// Parameter document of `frame`: instrument state, OPL settings and
    /// results, and pixel statistics.
    pub async fn parameters(&mut self, frame: &Array2<u16>, count: Option<usize>) -> DhmResult<HoloParameters> {
        let dhm = self.client.parameters().await?;
        let saturation = saturation_value(dhm.camera.bit_per_pixel.max(0) as u32);
        let stats = ImageStatistics::compute(frame, saturation, DEFAULT_CONTRAST_QUANTILE);

        let opl = OplParameters {
            mode: self.opl.mode.as_str().to_string(),
            short_steps: self.opl.steps,
            step_size_um: self.opl.step_um,
            contrast_threshold: self.opl.threshold,
            min_contrast: self.opl.min_contrast,
            min_span_um: self.opl.min_span_um,
            opt_mode: self.opl.optimize_exposure,
            init_position_um: self.last_scan.and_then(|s| s.initial),
            scan_result_um: self.last_scan.map(|s| s.position),
        };
        let image = stats.to_parameters(count, self.exposure.max_overflow);
        Ok(HoloParameters::new(dhm, opl, image))
    }

    /// Grabs a hologram and bundles it with its parameter document.
    pub async fn container(&mut self, optimize: bool) -> DhmResult<HoloRecord> {
        let (frame, count) = self.get_image(optimize).await?;
        let parameters = self.parameters(&frame, count).await?;
        let stage = self.stage_position().await?;
        Ok(HoloRecord {
            frame,
            parameters,
            stage,
        })
    }

    /// Ends the session with a graceful disconnect.
    pub async fn close(self) -> DhmResult<()> {
        self.client.close().await
    }
}
