//! Fixed-width per-stage timing for pipelines.
//!
//! Every pipeline kind declares its stages as an enum implementing [`ProfileStage`]. A
//! [`PipeProfile`] holds one slot per stage and is zeroed at the start of each frame, so stages a
//! frame skips read as zero rather than carrying a previous frame's time.

use std::{marker::PhantomData, time::Duration};

use serde::Serialize;

pub trait ProfileStage: Copy + 'static {
    /// Every stage, in slot order.
    const ALL: &'static [Self];

    fn slot(self) -> usize;

    fn label(self) -> &'static str;
}

#[derive(Clone, Debug)]
pub struct PipeProfile<S: ProfileStage> {
    nanos: Vec<u64>,
    _stages: PhantomData<S>,
}

impl<S: ProfileStage> Default for PipeProfile<S> {
    fn default() -> Self {
        Self {
            nanos: vec![0; S::ALL.len()],
            _stages: PhantomData,
        }
    }
}

impl<S: ProfileStage> PipeProfile<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.nanos.iter_mut().for_each(|slot| *slot = 0);
    }

    pub fn record(&mut self, stage: S, nanos: u64) {
        self.nanos[stage.slot()] = nanos;
    }

    /// Accumulate into a slot, for stages that run once per target.
    pub fn add(&mut self, stage: S, nanos: u64) {
        self.nanos[stage.slot()] = self.nanos[stage.slot()].saturating_add(nanos);
    }

    pub fn skip(&mut self, stage: S) {
        self.nanos[stage.slot()] = 0;
    }

    pub fn get(&self, stage: S) -> u64 {
        self.nanos[stage.slot()]
    }

    pub fn len(&self) -> usize {
        self.nanos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nanos.is_empty()
    }

    pub fn total_nanos(&self) -> u64 {
        self.nanos.iter().sum()
    }

    pub fn snapshot(&self, pipeline: &'static str) -> ProfileSnapshot {
        ProfileSnapshot {
            pipeline,
            stages: S::ALL
                .iter()
                .map(|stage| StageTiming {
                    stage: stage.label(),
                    nanos: self.get(*stage),
                })
                .collect(),
        }
    }

    /// Publish per-stage latency histograms.
    pub fn emit_metrics(&self, pipeline: &'static str) {
        for stage in S::ALL {
            metrics::histogram!(
                "vision_stage_latency_seconds",
                "pipeline" => pipeline,
                "stage" => stage.label()
            )
            .record(Duration::from_nanos(self.get(*stage)).as_secs_f64());
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct StageTiming {
    pub stage: &'static str,
    pub nanos: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ProfileSnapshot {
    pub pipeline: &'static str,
    pub stages: Vec<StageTiming>,
}

impl ProfileSnapshot {
    pub fn nanos(&self, stage: &str) -> Option<u64> {
        self.stages
            .iter()
            .find(|timing| timing.stage == stage)
            .map(|timing| timing.nanos)
    }

    /// `stage=1.23ms` pairs for trace output.
    pub fn summary(&self) -> String {
        self.stages
            .iter()
            .map(|t| format!("{}={:.2}ms", t.stage, t.nanos as f64 / 1e6))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Declare a stage enum with its labels and slot order.
macro_rules! profile_stages {
    ($(#[$meta:meta])* $vis:vis enum $name:ident { $($variant:ident => $label:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        $vis enum $name {
            $($variant),+
        }

        impl $crate::profile::ProfileStage for $name {
            const ALL: &'static [Self] = &[$($name::$variant),+];

            fn slot(self) -> usize {
                self as usize
            }

            fn label(self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }
    };
}

pub(crate) use profile_stages;

#[cfg(test)]
mod tests {
    use super::*;

    profile_stages! {
        enum TestStage {
            First => "first",
            Second => "second",
        }
    }

    #[test]
    fn reset_zeroes_previous_frame() {
        let mut profile = PipeProfile::<TestStage>::new();
        profile.record(TestStage::First, 10);
        profile.record(TestStage::Second, 20);
        profile.reset();
        profile.record(TestStage::Second, 5);
        assert_eq!(profile.get(TestStage::First), 0);
        assert_eq!(profile.total_nanos(), 5);
    }

    #[test]
    fn snapshot_lists_every_stage_in_order() {
        let mut profile = PipeProfile::<TestStage>::new();
        profile.add(TestStage::First, 3);
        profile.add(TestStage::First, 4);
        let snapshot = profile.snapshot("test");
        assert_eq!(snapshot.stages.len(), 2);
        assert_eq!(snapshot.nanos("first"), Some(7));
        assert_eq!(snapshot.nanos("second"), Some(0));
    }
}
