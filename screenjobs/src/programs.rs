//! Built-in screen programs and the host that ticks the active one.
//!
//! Programs are declared statically: each has a descriptor (name, tick
//! interval, typed option schema) and a constructor. The host runs at most
//! one program at a time on its own task.

use crate::ledger::Ledger;
use crate::screen::{Screen, ScreenError};
use crate::types::RunId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use wire::Color;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptionKind {
    Integer { min: i64, max: i64, default: i64 },
    Color { default: Color },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OptionSpec {
    pub key: &'static str,
    pub kind: OptionKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptionValue {
    Integer(i64),
    Color(Color),
}

impl OptionKind {
    fn default_value(&self) -> OptionValue {
        match *self {
            OptionKind::Integer { default, .. } => OptionValue::Integer(default),
            OptionKind::Color { default } => OptionValue::Color(default),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ProgramDescriptor {
    pub name: &'static str,
    pub tick_interval: Duration,
    pub options: &'static [OptionSpec],
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ProgramError {
    #[error("no program named {0}")]
    Unknown(String),
    #[error("program {program} has no option {key}")]
    UnknownOption { program: &'static str, key: String },
    #[error("option {key} expects {expected}")]
    WrongType { key: &'static str, expected: &'static str },
    #[error("option {key} must be within {min}..={max}, got {value}")]
    OutOfRange {
        key: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
    #[error("screen is in use by run {}", .run.short())]
    ScreenBusy { run: RunId },
}

/// Option values checked against a descriptor, with defaults filled in.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvedOptions(HashMap<&'static str, OptionValue>);

impl ResolvedOptions {
    pub fn integer(&self, key: &str) -> Option<i64> {
        match self.0.get(key) {
            Some(OptionValue::Integer(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn color(&self, key: &str) -> Option<Color> {
        match self.0.get(key) {
            Some(OptionValue::Color(c)) => Some(*c),
            _ => None,
        }
    }
}

impl ProgramDescriptor {
    pub fn resolve(
        &self,
        given: &HashMap<String, OptionValue>,
    ) -> Result<ResolvedOptions, ProgramError> {
        if let Some(key) = given
            .keys()
            .find(|key| !self.options.iter().any(|spec| spec.key == key.as_str()))
        {
            return Err(ProgramError::UnknownOption {
                program: self.name,
                key: key.to_string(),
            });
        }
        let mut resolved = HashMap::new();
        for spec in self.options {
            let value = match (spec.kind, given.get(spec.key)) {
                (kind, None) => kind.default_value(),
                (OptionKind::Integer { min, max, .. }, Some(&OptionValue::Integer(value))) => {
                    if value < min || value > max {
                        return Err(ProgramError::OutOfRange {
                            key: spec.key,
                            value,
                            min,
                            max,
                        });
                    }
                    OptionValue::Integer(value)
                }
                (OptionKind::Color { .. }, Some(&OptionValue::Color(color))) => {
                    OptionValue::Color(color)
                }
                (OptionKind::Integer { .. }, Some(_)) => {
                    return Err(ProgramError::WrongType {
                        key: spec.key,
                        expected: "an integer",
                    })
                }
                (OptionKind::Color { .. }, Some(_)) => {
                    return Err(ProgramError::WrongType {
                        key: spec.key,
                        expected: "a color",
                    })
                }
            };
            resolved.insert(spec.key, value);
        }
        Ok(ResolvedOptions(resolved))
    }
}

pub trait ScreenProgram: Send {
    fn tick(&mut self, screen: &dyn Screen) -> Result<(), ScreenError>;
}

struct Solid {
    color: Color,
}

impl ScreenProgram for Solid {
    fn tick(&mut self, screen: &dyn Screen) -> Result<(), ScreenError> {
        screen.fill(self.color)?;
        screen.render()
    }
}

struct Chase {
    color: Color,
    step: usize,
    position: usize,
}

impl ScreenProgram for Chase {
    fn tick(&mut self, screen: &dyn Screen) -> Result<(), ScreenError> {
        // pixels past the u16 index space are never visited
        let count = screen.pixel_count().min(wire::MAX_PIXELS);
        if count == 0 {
            return Ok(());
        }
        self.position %= count;
        let index = u16::try_from(self.position).unwrap_or(u16::MAX);
        screen.clear()?;
        screen.set_pixel(index, self.color)?;
        screen.render()?;
        self.position = (self.position + self.step) % count;
        Ok(())
    }
}

const SOLID_OPTIONS: &[OptionSpec] = &[OptionSpec {
    key: "color",
    kind: OptionKind::Color {
        default: Color::new(0xFFFFFF),
    },
}];

const CHASE_OPTIONS: &[OptionSpec] = &[
    OptionSpec {
        key: "color",
        kind: OptionKind::Color {
            default: Color::new(0x00FF00),
        },
    },
    OptionSpec {
        key: "step",
        kind: OptionKind::Integer {
            min: 1,
            max: 64,
            default: 1,
        },
    },
];

type Constructor = fn(&ResolvedOptions) -> Box<dyn ScreenProgram>;

fn new_solid(options: &ResolvedOptions) -> Box<dyn ScreenProgram> {
    Box::new(Solid {
        color: options.color("color").unwrap_or(Color::BLACK),
    })
}

fn new_chase(options: &ResolvedOptions) -> Box<dyn ScreenProgram> {
    Box::new(Chase {
        color: options.color("color").unwrap_or(Color::BLACK),
        step: options.integer("step").unwrap_or(1).max(1) as usize,
        position: 0,
    })
}

/// Static table of known programs.
#[derive(Clone)]
pub struct ProgramRegistry {
    programs: Vec<(ProgramDescriptor, Constructor)>,
}

impl Default for ProgramRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ProgramRegistry {
    pub fn builtin() -> Self {
        Self {
            programs: vec![
                (
                    ProgramDescriptor {
                        name: "solid",
                        tick_interval: Duration::from_millis(1000),
                        options: SOLID_OPTIONS,
                    },
                    new_solid as Constructor,
                ),
                (
                    ProgramDescriptor {
                        name: "chase",
                        tick_interval: Duration::from_millis(100),
                        options: CHASE_OPTIONS,
                    },
                    new_chase as Constructor,
                ),
            ],
        }
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ProgramDescriptor> {
        self.programs.iter().map(|(descriptor, _)| descriptor)
    }

    pub fn descriptor(&self, name: &str) -> Option<&ProgramDescriptor> {
        self.descriptors().find(|descriptor| descriptor.name == name)
    }

    pub fn instantiate(
        &self,
        name: &str,
        options: &HashMap<String, OptionValue>,
    ) -> Result<(ProgramDescriptor, Box<dyn ScreenProgram>), ProgramError> {
        let (descriptor, construct) = self
            .programs
            .iter()
            .find(|(descriptor, _)| descriptor.name == name)
            .ok_or_else(|| ProgramError::Unknown(name.to_string()))?;
        let resolved = descriptor.resolve(options)?;
        Ok((*descriptor, construct(&resolved)))
    }
}

struct Running {
    name: &'static str,
    options: HashMap<String, OptionValue>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Slots {
    active: Option<Running>,
    paused: Option<(&'static str, HashMap<String, OptionValue>)>,
}

/// Runs at most one built-in program against the screen.
///
/// Programs only start while no hardware run holds the screen. A hardware
/// run reserves the screen before it pauses programs, and the hold is checked
/// again under the slot lock at launch, so a start never slips in between.
pub struct ProgramHost {
    screen: Arc<dyn Screen>,
    registry: ProgramRegistry,
    ledger: Ledger,
    slots: Mutex<Slots>,
}

impl ProgramHost {
    pub fn new(screen: Arc<dyn Screen>, registry: ProgramRegistry, ledger: Ledger) -> Self {
        Self {
            screen,
            registry,
            ledger,
            slots: Mutex::new(Slots::default()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn registry(&self) -> &ProgramRegistry {
        &self.registry
    }

    /// Name of the program currently ticking.
    pub fn active(&self) -> Option<&'static str> {
        self.slots().active.as_ref().map(|running| running.name)
    }

    /// Name of the program waiting to be resumed.
    pub fn paused(&self) -> Option<&'static str> {
        self.slots().paused.as_ref().map(|(name, _)| *name)
    }

    /// Replace whatever is running with `name`.
    pub async fn start(
        &self,
        name: &str,
        options: HashMap<String, OptionValue>,
    ) -> Result<(), ProgramError> {
        let (descriptor, program) = self.registry.instantiate(name, &options)?;
        self.screen_free()?;
        if let Some(previous) = self.take_active() {
            halt(previous).await;
        }
        let mut slots = self.slots();
        self.screen_free()?;
        let running = self.launch(descriptor, program, options);
        slots.paused = None;
        if let Some(raced) = slots.active.replace(running) {
            let _ = raced.stop.send(true);
        }
        tracing::info!(program = descriptor.name, "started screen program");
        Ok(())
    }

    /// Stop the active program but remember it for `resume`. Returns the
    /// name of the program that was paused.
    pub async fn pause(&self, clear_screen: bool) -> Option<&'static str> {
        let running = self.take_active()?;
        let name = running.name;
        let options = running.options.clone();
        halt(running).await;
        self.slots().paused = Some((name, options));
        if clear_screen {
            self.blank();
        }
        tracing::info!(program = name, "paused screen program");
        Some(name)
    }

    /// Restart the most recently paused program. It stays paused if the
    /// screen is held by a hardware run.
    pub async fn resume(&self) -> Result<Option<&'static str>, ProgramError> {
        self.screen_free()?;
        let paused = self.slots().paused.take();
        match paused {
            Some((name, options)) => {
                if let Err(e) = self.start(name, options.clone()).await {
                    self.slots().paused.get_or_insert((name, options));
                    return Err(e);
                }
                Ok(Some(name))
            }
            None => Ok(None),
        }
    }

    /// Stop the active program and forget any paused one.
    pub async fn stop(&self) {
        let running = {
            let mut slots = self.slots();
            slots.paused = None;
            slots.active.take()
        };
        if let Some(running) = running {
            let name = running.name;
            halt(running).await;
            tracing::info!(program = name, "stopped screen program");
        }
    }

    fn screen_free(&self) -> Result<(), ProgramError> {
        match self.ledger.hardware_holder() {
            Some(holder) => Err(ProgramError::ScreenBusy { run: holder.run }),
            None => Ok(()),
        }
    }

    fn take_active(&self) -> Option<Running> {
        self.slots().active.take()
    }

    fn blank(&self) {
        if let Err(e) = self.screen.clear().and_then(|_| self.screen.render()) {
            tracing::warn!(error = %e, "could not clear screen");
        }
    }

    fn launch(
        &self,
        descriptor: ProgramDescriptor,
        mut program: Box<dyn ScreenProgram>,
        options: HashMap<String, OptionValue>,
    ) -> Running {
        let (stop, mut stop_rx) = watch::channel(false);
        let screen = self.screen.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(descriptor.tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = interval.tick() => {
                        if let Err(e) = program.tick(&*screen) {
                            tracing::warn!(program = descriptor.name, error = %e, "program tick failed");
                        }
                    }
                }
            }
        });
        Running {
            name: descriptor.name,
            options,
            stop,
            task,
        }
    }
}

async fn halt(running: Running) {
    let _ = running.stop.send(true);
    if let Err(e) = running.task.await {
        tracing::warn!(program = running.name, error = %e, "program task ended abnormally");
    }
}
