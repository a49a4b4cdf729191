//! Line-oriented pipeline control for local operation.
//!
//! Each stdin line is one command, e.g. `index 2`, `driver on`, `add apriltag Tags`,
//! `pnp 0 on`. Commands are parsed on a reader thread and applied by the runtime's consumer
//! loop through a [`PipelineControl`].

use std::io::BufRead;

use anyhow::{Context, Result, anyhow, bail};
use crossbeam_channel::Sender;
use tracing::{debug, info, warn};
use video_ingest::HsvThreshold;
use vision::{ConfigSnapshot, PipelineControl, PipelineSettings, PipelineType};

use crate::config::parse_hsv;

pub(crate) const HELP: &str = "commands: index <n> | driver on|off | calibrate on|off | snapshot | \
add <kind> <name> | dup <n> | remove <n> | kind <n> <kind> | rename <n> <name> | \
pnp <n> on|off | hsv <n> <h_lo,h_hi,s_lo,s_hi,v_lo,v_hi> | list | quit";

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ControlCommand {
    SetIndex(i32),
    DriverMode(bool),
    CalibrationMode(bool),
    Snapshot,
    Add { kind: PipelineType, nickname: String },
    Duplicate(i32),
    Remove(i32),
    ChangeKind { index: i32, kind: PipelineType },
    Rename { index: i32, nickname: String },
    SolvePnp { index: i32, enabled: bool },
    Hsv { index: i32, hsv: HsvThreshold },
    List,
    Quit,
}

impl ControlCommand {
    pub(crate) fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        let command = match verb.to_ascii_lowercase().as_str() {
            "index" => ControlCommand::SetIndex(parse_index(rest)?),
            "driver" => ControlCommand::DriverMode(parse_switch(rest)?),
            "calibrate" => ControlCommand::CalibrationMode(parse_switch(rest)?),
            "snapshot" => ControlCommand::Snapshot,
            "add" => {
                let (kind, nickname) = split_arg(rest)?;
                ControlCommand::Add {
                    kind: parse_kind(kind)?,
                    nickname: required(nickname, "name")?,
                }
            }
            "dup" | "duplicate" => ControlCommand::Duplicate(parse_index(rest)?),
            "remove" => ControlCommand::Remove(parse_index(rest)?),
            "kind" => {
                let (index, kind) = split_arg(rest)?;
                ControlCommand::ChangeKind {
                    index: parse_index(index)?,
                    kind: parse_kind(kind)?,
                }
            }
            "rename" => {
                let (index, nickname) = split_arg(rest)?;
                ControlCommand::Rename {
                    index: parse_index(index)?,
                    nickname: required(nickname, "name")?,
                }
            }
            "pnp" => {
                let (index, switch) = split_arg(rest)?;
                ControlCommand::SolvePnp {
                    index: parse_index(index)?,
                    enabled: parse_switch(switch)?,
                }
            }
            "hsv" => {
                let (index, window) = split_arg(rest)?;
                ControlCommand::Hsv {
                    index: parse_index(index)?,
                    hsv: parse_hsv(window)?,
                }
            }
            "list" => ControlCommand::List,
            "quit" | "exit" => ControlCommand::Quit,
            other => bail!("unknown command {other:?}; {HELP}"),
        };
        Ok(Some(command))
    }

    /// Apply to the running manager. `latest` is the most recent settings snapshot, used by
    /// commands that edit one field of an existing pipeline.
    pub(crate) fn apply(
        self,
        control: &PipelineControl,
        latest: &ConfigSnapshot,
    ) -> Result<()> {
        match self {
            ControlCommand::SetIndex(index) => control.set_index(index),
            ControlCommand::DriverMode(enabled) => control.set_driver_mode(enabled),
            ControlCommand::CalibrationMode(enabled) => control.set_calibration_mode(enabled),
            ControlCommand::Snapshot => control.take_calibration_snapshot()?,
            ControlCommand::Add { kind, nickname } => control.add_pipeline(kind, nickname)?,
            ControlCommand::Duplicate(index) => control.duplicate_pipeline(index)?,
            ControlCommand::Remove(index) => control.remove_pipeline(index)?,
            ControlCommand::ChangeKind { index, kind } => {
                control.change_pipeline_type(index, kind)?
            }
            ControlCommand::Rename { index, nickname } => {
                control.rename_pipeline(index, nickname)?
            }
            ControlCommand::SolvePnp { index, enabled } => {
                let mut settings = settings_at(latest, index)?;
                settings.base.solve_pnp_enabled = enabled;
                control.update_settings(index, settings)?;
            }
            ControlCommand::Hsv { index, hsv } => {
                let mut settings = settings_at(latest, index)?;
                settings.base.hsv = hsv;
                control.update_settings(index, settings)?;
            }
            ControlCommand::List => {
                for (position, name) in latest.nicknames.iter().enumerate() {
                    let kind = latest
                        .pipelines
                        .get(position)
                        .map(|settings| settings.pipeline_type().label())
                        .unwrap_or("?");
                    let marker = if position as i32 == latest.current_index { "*" } else { " " };
                    info!("{marker} {position}: {name} ({kind})");
                }
                if latest.current_index < 0 {
                    info!(index = latest.current_index, "built-in pipeline active");
                }
            }
            ControlCommand::Quit => {}
        }
        Ok(())
    }
}

fn settings_at(latest: &ConfigSnapshot, index: i32) -> Result<PipelineSettings> {
    usize::try_from(index)
        .ok()
        .and_then(|position| latest.pipelines.get(position))
        .cloned()
        .ok_or_else(|| anyhow!("no user pipeline at index {index}"))
}

fn split_arg(rest: &str) -> Result<(&str, &str)> {
    if rest.is_empty() {
        bail!("missing arguments");
    }
    let (first, second) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    Ok((first, second.trim()))
}

fn required(value: &str, what: &str) -> Result<String> {
    if value.is_empty() {
        bail!("missing {what}");
    }
    Ok(value.to_owned())
}

fn parse_index(text: &str) -> Result<i32> {
    text.trim()
        .parse::<i32>()
        .with_context(|| format!("invalid pipeline index {text:?}"))
}

fn parse_kind(text: &str) -> Result<PipelineType> {
    PipelineType::parse(text).ok_or_else(|| anyhow!("unknown pipeline kind {text:?}"))
}

fn parse_switch(text: &str) -> Result<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => Ok(true),
        "off" | "false" | "0" => Ok(false),
        other => bail!("expected on or off, got {other:?}"),
    }
}

/// Read commands from `input` until EOF or `quit`, forwarding parsed ones to `commands`.
pub(crate) fn read_commands(input: impl BufRead, commands: Sender<ControlCommand>) {
    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                warn!(%err, "failed to read control input");
                break;
            }
        };
        match ControlCommand::parse(&line) {
            Ok(Some(command)) => {
                let quit = command == ControlCommand::Quit;
                if commands.send(command).is_err() || quit {
                    break;
                }
            }
            Ok(None) => {}
            Err(err) => warn!("{err:#}"),
        }
    }
    debug!("control input closed");
}

#[cfg(test)]
mod tests {
    use std::{io::Cursor, sync::Arc};

    use video_ingest::FrameStaticProperties;
    use vision::PipelineManager;

    use super::*;
    use crate::testing::FlatBackend;

    #[test]
    fn parses_each_command_form() {
        let cases = [
            ("index 2", ControlCommand::SetIndex(2)),
            ("driver on", ControlCommand::DriverMode(true)),
            ("calibrate OFF", ControlCommand::CalibrationMode(false)),
            ("snapshot", ControlCommand::Snapshot),
            (
                "add apriltag Tag Wall",
                ControlCommand::Add {
                    kind: PipelineType::AprilTag,
                    nickname: "Tag Wall".into(),
                },
            ),
            ("dup 1", ControlCommand::Duplicate(1)),
            ("remove 0", ControlCommand::Remove(0)),
            (
                "kind 1 3",
                ControlCommand::ChangeKind {
                    index: 1,
                    kind: PipelineType::Aruco,
                },
            ),
            (
                "rename 0  Goal ",
                ControlCommand::Rename {
                    index: 0,
                    nickname: "Goal".into(),
                },
            ),
            (
                "pnp 0 off",
                ControlCommand::SolvePnp {
                    index: 0,
                    enabled: false,
                },
            ),
            ("list", ControlCommand::List),
            ("quit", ControlCommand::Quit),
        ];
        for (line, expected) in cases {
            assert_eq!(ControlCommand::parse(line).unwrap(), Some(expected), "{line}");
        }
    }

    #[test]
    fn blank_and_comment_lines_are_skipped() {
        assert_eq!(ControlCommand::parse("   ").unwrap(), None);
        assert_eq!(ControlCommand::parse("# note").unwrap(), None);
    }

    #[test]
    fn malformed_commands_are_rejected() {
        for line in ["index", "index two", "driver maybe", "add", "add lidar x", "rename 1", "warp 9"] {
            assert!(ControlCommand::parse(line).is_err(), "{line}");
        }
    }

    #[test]
    fn reader_stops_at_quit() {
        let (tx, rx) = crossbeam_channel::unbounded();
        read_commands(Cursor::new("index 1\nbogus\n\ndriver on\nquit\nindex 3\n"), tx);
        let received: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            received,
            vec![
                ControlCommand::SetIndex(1),
                ControlCommand::DriverMode(true),
                ControlCommand::Quit,
            ]
        );
    }

    #[test]
    fn field_edits_start_from_the_latest_snapshot() {
        let mut settings = PipelineSettings::new(PipelineType::Reflective, "tape");
        settings.base.contour_speckle_percentage = 12.0;
        let mut manager = PipelineManager::new(vec![settings], 0, Arc::new(FlatBackend));
        let props = Arc::new(FrameStaticProperties::new(320, 240, 70.0, None));
        let control = manager.control(props);
        let latest = manager.snapshot();

        ControlCommand::SolvePnp {
            index: 0,
            enabled: true,
        }
        .apply(&control, &latest)
        .unwrap();
        manager.current_pipeline();

        let updated = manager.pipeline_settings(0).unwrap();
        assert!(updated.base.solve_pnp_enabled);
        assert_eq!(updated.base.contour_speckle_percentage, 12.0);
        assert!(
            ControlCommand::Hsv {
                index: 4,
                hsv: HsvThreshold::default(),
            }
            .apply(&control, &latest)
            .is_err()
        );
    }
}
