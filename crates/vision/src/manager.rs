//! Ownership and runtime switching of pipelines.
//!
//! The [`PipelineManager`] lives on the processing thread and is the only place pipelines are
//! built or torn down. Other threads hold a [`PipelineControl`] handle: index changes are
//! written to a shared atomic slot and structural edits travel over a command queue. Both are
//! picked up by [`PipelineManager::current_pipeline`], which reconciles before handing out the
//! pipeline for the next frame, so a request never lands mid-frame.
//!
//! User pipelines are addressed by dense indices `0..N`. The built-in driver-mode and
//! calibration pipelines use the negative indices [`DRIVER_MODE_INDEX`] and
//! [`CALIBRATION_INDEX`] and are never stored in the user list.

use std::sync::{
    Arc,
    atomic::{AtomicI32, Ordering},
};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, info, warn};
use video_ingest::FrameStaticProperties;

use crate::{
    backend::VisionBackend,
    error::VisionError,
    events::{ConfigEvent, ConfigSnapshot, EventBus},
    pipeline::{
        self, CalibrationPipeline, CvPipeline, DriverModePipeline, kind_mismatch,
        validate_settings,
    },
    settings::{
        CALIBRATION_INDEX, DEFAULT_NICKNAME, DRIVER_MODE_INDEX, PipelineSettings, PipelineType,
    },
};

/// Index requests shared between the processing thread and control handles.
#[derive(Debug)]
struct RequestSlots {
    requested: AtomicI32,
    last_user: AtomicI32,
}

impl RequestSlots {
    fn request(&self, index: i32) {
        self.requested.store(index, Ordering::SeqCst);
    }

    fn requested(&self) -> i32 {
        self.requested.load(Ordering::SeqCst)
    }

    fn set_mode(&self, mode: i32, enabled: bool) {
        if enabled {
            self.request(mode);
        } else {
            // Only a pending or active request for `mode` is turned back into the last user
            // pipeline; a newer request for another index wins.
            let last_user = self.last_user.load(Ordering::SeqCst);
            let _ = self.requested.compare_exchange(
                mode,
                last_user,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
    }
}

/// Structural edits queued by a [`PipelineControl`] and applied on the processing thread.
#[derive(Debug)]
enum ManagerCommand {
    Add {
        pipeline_type: PipelineType,
        nickname: String,
    },
    Duplicate(i32),
    Remove(i32),
    ChangeType {
        index: i32,
        pipeline_type: PipelineType,
    },
    Rename {
        index: i32,
        nickname: String,
    },
    UpdateSettings {
        index: i32,
        settings: Box<PipelineSettings>,
    },
    TakeCalibrationSnapshot,
}

fn invalid(message: impl Into<String>) -> VisionError {
    VisionError::InvalidRequest(message.into())
}

/// `nickname`, or the first free variant of it with a `(n)` suffix.
///
/// A name already ending in `(n)` has that number incremented rather than a second suffix
/// appended.
pub fn unique_name(nickname: &str, existing: &[PipelineSettings]) -> String {
    let mut name = nickname.to_owned();
    while existing.iter().any(|s| s.nickname() == name) {
        name = match numbered_suffix(&name) {
            Some((stem, number)) => format!("{stem}({})", number.saturating_add(1)),
            None => format!("{name} (1)"),
        };
    }
    name
}

/// Split `"Name (3)"` into `("Name ", 3)`. An empty `()` counts as zero.
fn numbered_suffix(name: &str) -> Option<(&str, u64)> {
    let inner = name.strip_suffix(')')?;
    let open = inner.rfind('(')?;
    let digits = &inner[open + 1..];
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let number = if digits.is_empty() {
        0
    } else {
        digits.parse().ok()?
    };
    Some((&inner[..open], number))
}

pub struct PipelineManager {
    user_settings: Vec<PipelineSettings>,
    driver_mode: DriverModePipeline,
    calibration: CalibrationPipeline,
    current_user: Option<Box<dyn CvPipeline>>,
    current_index: i32,
    /// Rebuild the active user pipeline even if the requested index is unchanged.
    force_rebuild: bool,
    slots: Arc<RequestSlots>,
    commands_tx: Sender<ManagerCommand>,
    commands: Receiver<ManagerCommand>,
    backend: Arc<dyn VisionBackend>,
    events: EventBus,
}

impl PipelineManager {
    /// Take ownership of the persisted user pipelines and activate `default_index`.
    ///
    /// Built-in kinds found in `pipelines` are dropped. An empty list gets one AprilTag
    /// pipeline so there is always a user pipeline to return to.
    pub fn new(
        pipelines: Vec<PipelineSettings>,
        default_index: i32,
        backend: Arc<dyn VisionBackend>,
    ) -> Self {
        let user_settings = pipelines
            .into_iter()
            .filter(|settings| {
                let keep = settings.pipeline_type().is_user_type();
                if !keep {
                    warn!(
                        nickname = settings.nickname(),
                        "ignoring built-in pipeline in the user pipeline list"
                    );
                }
                keep
            })
            .collect();
        let (commands_tx, commands) = crossbeam_channel::unbounded();
        let mut manager = Self {
            user_settings,
            driver_mode: DriverModePipeline::new(PipelineSettings::new(
                PipelineType::DriverMode,
                "Driver Mode",
            )),
            calibration: CalibrationPipeline::new(
                PipelineSettings::new(PipelineType::Calib3d, "Calibration"),
                Arc::clone(&backend),
            ),
            current_user: None,
            current_index: DRIVER_MODE_INDEX,
            force_rebuild: false,
            slots: Arc::new(RequestSlots {
                requested: AtomicI32::new(default_index),
                last_user: AtomicI32::new(0),
            }),
            commands_tx,
            commands,
            backend,
            events: EventBus::new(),
        };
        manager.reassign_indexes();
        if manager.user_settings.is_empty() {
            let mut settings = PipelineSettings::new(PipelineType::AprilTag, DEFAULT_NICKNAME);
            settings.base.pipeline_index = 0;
            manager.user_settings.push(settings);
        }
        manager.reconcile();
        manager
    }

    /// A handle for other threads. `props` describes the camera that settings updates are
    /// validated against.
    pub fn control(&self, props: Arc<FrameStaticProperties>) -> PipelineControl {
        PipelineControl {
            slots: Arc::clone(&self.slots),
            commands: self.commands_tx.clone(),
            backend: Arc::clone(&self.backend),
            props,
            events: self.events.clone(),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn current_index(&self) -> i32 {
        self.current_index
    }

    pub fn requested_index(&self) -> i32 {
        self.slots.requested()
    }

    pub fn last_user_index(&self) -> i32 {
        self.slots.last_user.load(Ordering::SeqCst)
    }

    pub fn driver_mode(&self) -> bool {
        self.current_index == DRIVER_MODE_INDEX
    }

    pub fn user_pipelines(&self) -> &[PipelineSettings] {
        &self.user_settings
    }

    pub fn nicknames(&self) -> Vec<String> {
        self.user_settings
            .iter()
            .map(|settings| settings.nickname().to_owned())
            .collect()
    }

    pub fn pipeline_settings(&self, index: i32) -> Option<&PipelineSettings> {
        match index {
            DRIVER_MODE_INDEX => Some(self.driver_mode.settings()),
            CALIBRATION_INDEX => Some(self.calibration.settings()),
            _ => self.user_slot(index).map(|slot| &self.user_settings[slot]),
        }
    }

    pub fn current_settings(&self) -> Option<&PipelineSettings> {
        self.pipeline_settings(self.current_index)
    }

    pub fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            current_index: self.current_index,
            driver_mode: self.driver_mode(),
            nicknames: self.nicknames(),
            pipelines: self.user_settings.clone(),
        }
    }

    pub fn set_index(&self, index: i32) {
        self.slots.request(index);
    }

    pub fn set_driver_mode(&self, enabled: bool) {
        self.slots.set_mode(DRIVER_MODE_INDEX, enabled);
    }

    pub fn set_calibration_mode(&self, enabled: bool) {
        self.slots.set_mode(CALIBRATION_INDEX, enabled);
    }

    /// Reconcile pending requests, then return the pipeline for the next frame.
    pub fn current_pipeline(&mut self) -> &mut dyn CvPipeline {
        self.reconcile();
        match self.current_index {
            CALIBRATION_INDEX => &mut self.calibration,
            DRIVER_MODE_INDEX => &mut self.driver_mode,
            _ => match self.current_user.as_deref_mut() {
                Some(pipeline) => pipeline,
                None => &mut self.driver_mode,
            },
        }
    }

    /// Append a pipeline of `pipeline_type` and return its index.
    pub fn add_pipeline(
        &mut self,
        pipeline_type: PipelineType,
        nickname: &str,
    ) -> Result<i32, VisionError> {
        if !pipeline_type.is_user_type() {
            return Err(invalid(format!(
                "cannot add a {} pipeline",
                pipeline_type.label()
            )));
        }
        let mut settings = PipelineSettings::new(pipeline_type, nickname);
        settings.base.pipeline_index = self.user_settings.len() as i32;
        self.user_settings.push(settings);
        self.reassign_indexes();
        let index = self.user_settings.len() as i32 - 1;
        info!(index, kind = pipeline_type.label(), nickname, "pipeline added");
        self.publish_settings();
        Ok(index)
    }

    /// Copy the pipeline at `index` to the end of the list under a unique name. Returns the
    /// copy's index.
    pub fn duplicate_pipeline(&mut self, index: i32) -> Result<i32, VisionError> {
        let slot = self
            .user_slot(index)
            .ok_or_else(|| invalid(format!("no user pipeline at index {index}")))?;
        let mut copy = self.user_settings[slot].clone();
        copy.base.pipeline_nickname = unique_name(copy.nickname(), &self.user_settings);
        copy.base.pipeline_index = i32::MAX;
        debug!(index, nickname = copy.nickname(), "duplicating pipeline");
        self.user_settings.push(copy);
        self.reassign_indexes();
        self.publish_settings();
        Ok(self.user_settings.len() as i32 - 1)
    }

    /// Remove the pipeline at `index` and request its neighbour. Returns the requested index.
    pub fn remove_pipeline(&mut self, index: i32) -> Result<i32, VisionError> {
        let slot = self
            .user_slot(index)
            .ok_or_else(|| invalid(format!("no user pipeline at index {index}")))?;
        if self.user_settings.len() == 1 {
            return Err(invalid("cannot remove the only user pipeline"));
        }
        let removed = self.user_settings.remove(slot);
        self.reassign_indexes();

        let last = self.user_settings.len() as i32 - 1;
        let next = index.min(last);
        if self.last_user_index() > last {
            self.slots.last_user.store(next, Ordering::SeqCst);
        }
        self.slots.request(next);
        self.force_rebuild = true;
        info!(index, nickname = removed.nickname(), next, "pipeline removed");
        Ok(next)
    }

    /// Replace the pipeline at `index` with defaults of another kind, keeping its shared base
    /// fields, and rebuild it as the active pipeline.
    pub fn change_pipeline_type(
        &mut self,
        index: i32,
        pipeline_type: PipelineType,
    ) -> Result<(), VisionError> {
        if !pipeline_type.is_user_type() {
            return Err(invalid(format!(
                "cannot change a user pipeline into {}",
                pipeline_type.label()
            )));
        }
        let slot = self
            .user_slot(index)
            .ok_or_else(|| invalid(format!("cannot change the kind of pipeline {index}")))?;
        let current = &self.user_settings[slot];
        if current.pipeline_type() == pipeline_type {
            debug!(index, kind = pipeline_type.label(), "pipeline already has this kind");
            return Ok(());
        }
        info!(
            index,
            from = current.pipeline_type().label(),
            to = pipeline_type.label(),
            "changing pipeline kind"
        );
        let converted = current.converted_to(pipeline_type);
        self.user_settings[slot] = converted;
        self.reassign_indexes();
        self.slots.request(index);
        self.force_rebuild = true;
        Ok(())
    }

    pub fn rename_pipeline(&mut self, index: i32, nickname: &str) -> Result<(), VisionError> {
        let mut settings = self
            .pipeline_settings(index)
            .cloned()
            .ok_or_else(|| invalid(format!("no pipeline at index {index}")))?;
        settings.base.pipeline_nickname = nickname.to_owned();
        self.update_settings(index, settings)
    }

    /// Store new settings for the pipeline at `index`. The kind must match; the index is
    /// forced to `index`. A running pipeline picks the settings up on its next frame.
    ///
    /// Stage parameters are not checked here; [`PipelineControl::update_settings`] validates
    /// before queueing.
    pub fn update_settings(
        &mut self,
        index: i32,
        mut settings: PipelineSettings,
    ) -> Result<(), VisionError> {
        let expected = self
            .pipeline_settings(index)
            .map(PipelineSettings::pipeline_type)
            .ok_or_else(|| invalid(format!("no pipeline at index {index}")))?;
        if expected != settings.pipeline_type() {
            return Err(kind_mismatch(expected, &settings));
        }
        settings.base.pipeline_index = index;

        match index {
            DRIVER_MODE_INDEX => self.driver_mode.set_settings(settings)?,
            CALIBRATION_INDEX => self.calibration.set_settings(settings)?,
            _ => {
                if let Some(slot) = self.user_slot(index) {
                    if index == self.current_index {
                        if let Some(live) = self.current_user.as_deref_mut() {
                            live.set_settings(settings.clone())?;
                        }
                    }
                    self.user_settings[slot] = settings;
                }
            }
        }
        self.publish_settings();
        Ok(())
    }

    /// Capture a board snapshot on the next calibration frame that shows the whole board.
    pub fn take_calibration_snapshot(&mut self) -> Result<(), VisionError> {
        if self.current_index != CALIBRATION_INDEX {
            return Err(invalid("calibration snapshots need calibration mode"));
        }
        self.calibration.request_snapshot();
        Ok(())
    }

    /// Drop backend resources held by the active pipelines.
    pub fn release(&mut self) {
        if let Some(pipeline) = self.current_user.as_deref_mut() {
            pipeline.release();
        }
        self.calibration.release();
    }

    fn user_slot(&self, index: i32) -> Option<usize> {
        usize::try_from(index)
            .ok()
            .filter(|&slot| slot < self.user_settings.len())
    }

    fn is_valid_index(&self, index: i32) -> bool {
        index == DRIVER_MODE_INDEX || index == CALIBRATION_INDEX || self.user_slot(index).is_some()
    }

    fn reassign_indexes(&mut self) {
        self.user_settings
            .sort_by_key(|settings| settings.base.pipeline_index);
        for (index, settings) in self.user_settings.iter_mut().enumerate() {
            settings.base.pipeline_index = index as i32;
        }
    }

    fn apply_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            let outcome = match command {
                ManagerCommand::Add {
                    pipeline_type,
                    nickname,
                } => self.add_pipeline(pipeline_type, &nickname).map(drop),
                ManagerCommand::Duplicate(index) => self.duplicate_pipeline(index).map(drop),
                ManagerCommand::Remove(index) => self.remove_pipeline(index).map(drop),
                ManagerCommand::ChangeType {
                    index,
                    pipeline_type,
                } => self.change_pipeline_type(index, pipeline_type),
                ManagerCommand::Rename { index, nickname } => {
                    self.rename_pipeline(index, &nickname)
                }
                ManagerCommand::UpdateSettings { index, settings } => {
                    self.update_settings(index, *settings)
                }
                ManagerCommand::TakeCalibrationSnapshot => self.take_calibration_snapshot(),
            };
            if let Err(err) = outcome {
                metrics::counter!("vision_pipeline_rejected_requests_total").increment(1);
                warn!("dropping pipeline request: {err}");
            }
        }
    }

    fn reconcile(&mut self) {
        self.apply_commands();

        let requested = self.slots.requested();
        if requested == self.current_index && !self.force_rebuild {
            return;
        }

        let mut target = requested;
        if !self.is_valid_index(requested) {
            metrics::counter!("vision_pipeline_rejected_requests_total").increment(1);
            warn!(
                requested,
                pipelines = self.user_settings.len(),
                "requested pipeline does not exist; keeping the current one"
            );
            target = if self.is_valid_index(self.current_index) {
                self.current_index
            } else {
                self.current_index.min(self.user_settings.len() as i32 - 1)
            };
            let _ = self.slots.requested.compare_exchange(
                requested,
                target,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            if target == self.current_index && !self.force_rebuild {
                return;
            }
        }
        self.switch_to(target);
    }

    fn switch_to(&mut self, target: i32) {
        let previous = self.current_index;
        let _span =
            tracing::info_span!("pipeline_manager.reconcile", from = previous, to = target)
                .entered();

        if target < 0 && previous >= 0 {
            self.slots.last_user.store(previous, Ordering::SeqCst);
        }
        if previous == CALIBRATION_INDEX && target != CALIBRATION_INDEX {
            self.finish_calibration();
        }
        if target == CALIBRATION_INDEX && previous != CALIBRATION_INDEX {
            if !self.calibration.snapshots().is_empty() {
                self.finish_calibration();
            }
            self.calibration.begin_session();
        }

        self.current_index = target;
        if target >= 0 {
            self.rebuild_user_pipeline();
        }
        self.force_rebuild = false;

        metrics::counter!("vision_pipeline_switches_total").increment(1);
        info!(
            from = previous,
            to = target,
            kind = self.current_settings().map(|s| s.pipeline_type().label()),
            "active pipeline changed"
        );
        self.publish_settings();
    }

    fn rebuild_user_pipeline(&mut self) {
        if let Some(mut old) = self.current_user.take() {
            old.release();
        }
        let Some(settings) = self.current_settings().cloned() else {
            return;
        };
        debug!(kind = settings.pipeline_type().label(), "building user pipeline");
        self.current_user = Some(pipeline::build(settings, Arc::clone(&self.backend)));
    }

    fn finish_calibration(&mut self) {
        match self.calibration.finish_calibration() {
            Ok(Some(calibration)) => {
                self.events.publish(ConfigEvent::CalibrationComplete(calibration))
            }
            Ok(None) => {}
            Err(err) => error!("camera calibration failed: {err}"),
        }
    }

    fn publish_settings(&self) {
        self.events
            .publish(ConfigEvent::FullSettings(Box::new(self.snapshot())));
    }
}

/// Cloneable handle for requesting pipeline changes from any thread.
///
/// Index changes take effect at the processing thread's next reconciliation. Structural edits
/// are queued; a rejected edit is logged there and counted in
/// `vision_pipeline_rejected_requests_total`.
#[derive(Clone)]
pub struct PipelineControl {
    slots: Arc<RequestSlots>,
    commands: Sender<ManagerCommand>,
    backend: Arc<dyn VisionBackend>,
    props: Arc<FrameStaticProperties>,
    events: EventBus,
}

impl PipelineControl {
    pub fn set_index(&self, index: i32) {
        self.slots.request(index);
    }

    pub fn set_driver_mode(&self, enabled: bool) {
        self.slots.set_mode(DRIVER_MODE_INDEX, enabled);
    }

    pub fn set_calibration_mode(&self, enabled: bool) {
        self.slots.set_mode(CALIBRATION_INDEX, enabled);
    }

    pub fn requested_index(&self) -> i32 {
        self.slots.requested()
    }

    pub fn subscribe(&self) -> Receiver<ConfigEvent> {
        self.events.subscribe()
    }

    pub fn add_pipeline(
        &self,
        pipeline_type: PipelineType,
        nickname: impl Into<String>,
    ) -> Result<(), VisionError> {
        if !pipeline_type.is_user_type() {
            return Err(invalid(format!(
                "cannot add a {} pipeline",
                pipeline_type.label()
            )));
        }
        self.send(ManagerCommand::Add {
            pipeline_type,
            nickname: nickname.into(),
        })
    }

    pub fn duplicate_pipeline(&self, index: i32) -> Result<(), VisionError> {
        self.send(ManagerCommand::Duplicate(index))
    }

    pub fn remove_pipeline(&self, index: i32) -> Result<(), VisionError> {
        self.send(ManagerCommand::Remove(index))
    }

    pub fn change_pipeline_type(
        &self,
        index: i32,
        pipeline_type: PipelineType,
    ) -> Result<(), VisionError> {
        if index < 0 || !pipeline_type.is_user_type() {
            return Err(invalid(format!(
                "cannot change pipeline {index} into {}",
                pipeline_type.label()
            )));
        }
        self.send(ManagerCommand::ChangeType {
            index,
            pipeline_type,
        })
    }

    pub fn rename_pipeline(&self, index: i32, nickname: impl Into<String>) -> Result<(), VisionError> {
        self.send(ManagerCommand::Rename {
            index,
            nickname: nickname.into(),
        })
    }

    /// Check every stage parameter of `settings`, then queue it for the pipeline at `index`.
    /// Invalid settings are returned to the caller and never reach the running pipeline.
    pub fn update_settings(
        &self,
        index: i32,
        settings: PipelineSettings,
    ) -> Result<(), VisionError> {
        validate_settings(&settings, Arc::clone(&self.backend), &self.props)?;
        self.send(ManagerCommand::UpdateSettings {
            index,
            settings: Box::new(settings),
        })
    }

    pub fn take_calibration_snapshot(&self) -> Result<(), VisionError> {
        self.send(ManagerCommand::TakeCalibrationSnapshot)
    }

    fn send(&self, command: ManagerCommand) -> Result<(), VisionError> {
        self.commands
            .send(command)
            .map_err(|_| VisionError::ManagerGone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(names: &[&str]) -> Vec<PipelineSettings> {
        names
            .iter()
            .map(|name| PipelineSettings::new(PipelineType::Reflective, *name))
            .collect()
    }

    #[test]
    fn unique_name_appends_then_increments() {
        let existing = named(&["Cam", "Cam (1)", "Other (7)"]);
        assert_eq!(unique_name("Fresh", &existing), "Fresh");
        assert_eq!(unique_name("Cam", &existing), "Cam (2)");
        assert_eq!(unique_name("Other (7)", &existing), "Other (8)");
    }

    #[test]
    fn suffix_parsing_accepts_only_digits() {
        assert_eq!(numbered_suffix("Cam (12)"), Some(("Cam ", 12)));
        assert_eq!(numbered_suffix("Cam ()"), Some(("Cam ", 0)));
        assert_eq!(numbered_suffix("Cam (x1)"), None);
        assert_eq!(numbered_suffix("Cam"), None);
    }

    #[test]
    fn leaving_a_mode_only_reverts_its_own_request() {
        let slots = RequestSlots {
            requested: AtomicI32::new(2),
            last_user: AtomicI32::new(1),
        };
        slots.set_mode(DRIVER_MODE_INDEX, false);
        assert_eq!(slots.requested(), 2);
        slots.set_mode(DRIVER_MODE_INDEX, true);
        slots.set_mode(DRIVER_MODE_INDEX, false);
        assert_eq!(slots.requested(), 1);
    }
}
