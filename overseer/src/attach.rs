//! Probe attachment and cleanup.
//!
//! Every link is pinned under `<pin_dir>/overseer_<device>_<direction>`, so
//! a restarted agent replaces its previous attachment instead of stacking a
//! second one next to it. Shutdown unpins everything carrying that prefix and
//! nothing else.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use aya::programs::links::{FdLink, PinnedLink};
use aya::programs::tc::SchedClassifierLink;
use aya::programs::xdp::XdpLink;
use aya::programs::{tc, ProgramError, SchedClassifier, TcAttachType, Xdp, XdpFlags};
use aya::Ebpf;
use thiserror::Error;

use crate::codec::{Direction, ProbeLayout};

pub const PIN_PREFIX: &str = "overseer_";

const XDP_PROGRAM: &str = "overseer";
const INGRESS_PROGRAM: &str = "overseer_ingress";
const EGRESS_PROGRAM: &str = "overseer_egress";

#[derive(Error, Debug)]
pub enum AttachError {
    #[error("missing device name")]
    EmptyDevice,
    #[error("unknown device {device:?}: {source}")]
    UnknownDevice {
        device: String,
        #[source]
        source: nix::Error,
    },
    #[error("probe has no program {0:?}")]
    MissingProgram(&'static str),
    #[error("program {program}: {source}")]
    Program {
        program: &'static str,
        #[source]
        source: ProgramError,
    },
    #[error("failed to add clsact qdisc on {device}: {source}")]
    Qdisc {
        device: String,
        #[source]
        source: io::Error,
    },
    #[error("cannot attach for direction {0}")]
    UnsupportedDirection(Direction),
    #[error("probe already released")]
    Released,
}

/// One attachment point.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub device: String,
    /// `None` for the single-direction XDP probe.
    pub direction: Option<Direction>,
}

impl Target {
    pub fn pin_name(&self) -> String {
        let direction = self.direction.map_or("xdp", |d| d.as_str());
        format!("{PIN_PREFIX}{}_{direction}", self.device)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.direction {
            Some(direction) => write!(f, "{} ({direction})", self.device),
            None => f.write_str(&self.device),
        }
    }
}

/// Expand configured devices into attachment points for `layout`.
pub fn targets(devices: &[String], layout: ProbeLayout, directions: &[Direction]) -> Vec<Target> {
    devices
        .iter()
        .flat_map(|device| {
            let directions: Vec<Option<Direction>> = if layout.has_direction() {
                directions.iter().copied().map(Some).collect()
            } else {
                vec![None]
            };
            directions.into_iter().map(move |direction| Target {
                device: device.clone(),
                direction,
            })
        })
        .collect()
}

pub trait Attach {
    /// Attach the probe at `target`, replacing an earlier attachment there.
    fn attach(&mut self, target: &Target) -> Result<(), AttachError>;

    /// Release every attachment and persisted handle. Never fails; problems
    /// are logged.
    fn detach_all(&mut self);
}

#[derive(Debug, Default)]
pub struct AttachReport {
    pub attached: Vec<Target>,
    pub failed: Vec<(Target, String)>,
}

/// Attach every target. A failure is logged and does not stop the others.
pub fn attach_all<A: Attach + ?Sized>(attacher: &mut A, targets: &[Target]) -> AttachReport {
    let mut report = AttachReport::default();
    for target in targets {
        match attacher.attach(target) {
            Ok(()) => report.attached.push(target.clone()),
            Err(e) => {
                tracing::error!(target = %target, error = %e, "failed to attach probe");
                report.failed.push((target.clone(), e.to_string()));
            }
        }
    }
    if report.attached.is_empty() && !targets.is_empty() {
        tracing::warn!("probe is not attached to any device");
    }
    report
}

/// Remove every entry of `dir` whose name starts with `prefix`.
pub fn sweep_pins(dir: &Path, prefix: &str) -> usize {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return 0,
        Err(e) => {
            tracing::error!(dir = %dir.display(), error = %e, "failed to list pin directory");
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(prefix) {
            continue;
        }
        let path = entry.path();
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(pin = %path.display(), "removed pinned handle");
                removed += 1;
            }
            Err(e) => tracing::error!(pin = %path.display(), error = %e, "failed to remove pinned handle"),
        }
    }
    removed
}

enum HeldLink {
    Pinned(PinnedLink),
    Xdp(XdpLink),
    Tc(SchedClassifierLink),
}

impl HeldLink {
    fn release(self, target: &Target) {
        match self {
            HeldLink::Pinned(link) => match link.unpin() {
                Ok(fd) => drop(fd),
                Err(e) => tracing::error!(target = %target, error = %e, "failed to unpin link"),
            },
            HeldLink::Xdp(link) => drop(link),
            HeldLink::Tc(link) => drop(link),
        }
        tracing::info!(target = %target, "probe unloaded");
    }
}

/// Attaches the loaded probe through aya.
pub struct ProbeAttacher {
    bpf: Option<Ebpf>,
    pin_dir: PathBuf,
    links: HashMap<Target, HeldLink>,
}

impl ProbeAttacher {
    pub fn new(bpf: Ebpf, pin_dir: PathBuf) -> Self {
        if let Err(e) = fs::create_dir_all(&pin_dir) {
            tracing::warn!(dir = %pin_dir.display(), error = %e, "failed to create pin directory");
        }
        Self {
            bpf: Some(bpf),
            pin_dir,
            links: HashMap::new(),
        }
    }
}

fn program_error(program: &'static str) -> impl Fn(ProgramError) -> AttachError {
    move |source| AttachError::Program { program, source }
}

fn xdp_program(bpf: &mut Ebpf) -> Result<&mut Xdp, AttachError> {
    let program: &mut Xdp = bpf
        .program_mut(XDP_PROGRAM)
        .ok_or(AttachError::MissingProgram(XDP_PROGRAM))?
        .try_into()
        .map_err(program_error(XDP_PROGRAM))?;
    if program.fd().is_err() {
        program.load().map_err(program_error(XDP_PROGRAM))?;
    }
    Ok(program)
}

fn classifier<'a>(
    bpf: &'a mut Ebpf,
    name: &'static str,
) -> Result<&'a mut SchedClassifier, AttachError> {
    let program: &mut SchedClassifier = bpf
        .program_mut(name)
        .ok_or(AttachError::MissingProgram(name))?
        .try_into()
        .map_err(program_error(name))?;
    if program.fd().is_err() {
        program.load().map_err(program_error(name))?;
    }
    Ok(program)
}

/// Try to persist `link` at `pin_path`. A link that cannot be pinned is
/// released by the attempt, so the caller re-attaches it in-process.
fn try_pin<L>(link: L, pin_path: &Path) -> Option<PinnedLink>
where
    FdLink: TryFrom<L>,
    <FdLink as TryFrom<L>>::Error: fmt::Display,
{
    let fd = match FdLink::try_from(link) {
        Ok(fd) => fd,
        Err(e) => {
            tracing::debug!(error = %e, "link is not fd-based, holding it in-process");
            return None;
        }
    };
    match fd.pin(pin_path) {
        Ok(pinned) => Some(pinned),
        Err(e) => {
            tracing::warn!(pin = %pin_path.display(), error = %e, "failed to pin link");
            None
        }
    }
}

/// Detach whatever a previous run left pinned at `pin_path`.
fn release_stale_pin(pin_path: &Path) {
    if !pin_path.exists() {
        return;
    }
    match PinnedLink::from_pin(pin_path) {
        Ok(stale) => match stale.unpin() {
            Ok(fd) => {
                drop(fd);
                tracing::info!(pin = %pin_path.display(), "replaced stale attachment");
            }
            Err(e) => tracing::warn!(pin = %pin_path.display(), error = %e, "failed to unpin stale link"),
        },
        Err(e) => {
            tracing::warn!(pin = %pin_path.display(), error = %e, "stale pin is not a link, removing");
            if let Err(e) = fs::remove_file(pin_path) {
                tracing::error!(pin = %pin_path.display(), error = %e, "failed to remove stale pin");
            }
        }
    }
}

fn attach_xdp(bpf: &mut Ebpf, device: &str, pin_path: &Path) -> Result<HeldLink, AttachError> {
    let program = xdp_program(bpf)?;
    let mut attach = || {
        program
            .attach(device, XdpFlags::default())
            .and_then(|id| program.take_link(id))
            .map_err(program_error(XDP_PROGRAM))
    };

    if let Some(pinned) = try_pin(attach()?, pin_path) {
        return Ok(HeldLink::Pinned(pinned));
    }
    Ok(HeldLink::Xdp(attach()?))
}

fn attach_tc(
    bpf: &mut Ebpf,
    device: &str,
    direction: Direction,
    pin_path: &Path,
) -> Result<HeldLink, AttachError> {
    let (name, attach_type) = match direction {
        Direction::Ingress => (INGRESS_PROGRAM, TcAttachType::Ingress),
        Direction::Egress => (EGRESS_PROGRAM, TcAttachType::Egress),
        Direction::Unknown(_) => return Err(AttachError::UnsupportedDirection(direction)),
    };

    // If the clsact qdisc already exists (EEXIST), that is fine.
    if let Err(e) = tc::qdisc_add_clsact(device) {
        if e.raw_os_error() != Some(nix::errno::Errno::EEXIST as i32) {
            return Err(AttachError::Qdisc {
                device: device.to_string(),
                source: e,
            });
        }
        tracing::debug!("clsact qdisc already exists on {}, reusing", device);
    }

    let program = classifier(bpf, name)?;
    let mut attach = || {
        program
            .attach(device, attach_type)
            .and_then(|id| program.take_link(id))
            .map_err(program_error(name))
    };

    if let Some(pinned) = try_pin(attach()?, pin_path) {
        return Ok(HeldLink::Pinned(pinned));
    }
    Ok(HeldLink::Tc(attach()?))
}

/// Interface index of `target`'s device.
fn resolve_device(target: &Target) -> Result<u32, AttachError> {
    if target.device.is_empty() {
        return Err(AttachError::EmptyDevice);
    }
    nix::net::if_::if_nametoindex(target.device.as_str()).map_err(|source| {
        AttachError::UnknownDevice {
            device: target.device.clone(),
            source,
        }
    })
}

impl Attach for ProbeAttacher {
    fn attach(&mut self, target: &Target) -> Result<(), AttachError> {
        let ifindex = resolve_device(target)?;
        let bpf = self.bpf.as_mut().ok_or(AttachError::Released)?;

        if let Some(previous) = self.links.remove(target) {
            previous.release(target);
        }
        let pin_path = self.pin_dir.join(target.pin_name());
        release_stale_pin(&pin_path);

        let link = match target.direction {
            None => attach_xdp(bpf, &target.device, &pin_path)?,
            Some(direction) => attach_tc(bpf, &target.device, direction, &pin_path)?,
        };
        let pinned = matches!(link, HeldLink::Pinned(_));
        self.links.insert(target.clone(), link);

        tracing::info!(target = %target, ifindex, pinned, "probe loaded on device");
        Ok(())
    }

    fn detach_all(&mut self) {
        for (target, link) in self.links.drain() {
            link.release(&target);
        }
        if self.bpf.take().is_some() {
            tracing::debug!("released probe programs and maps");
        }
        let removed = sweep_pins(&self.pin_dir, PIN_PREFIX);
        if removed > 0 {
            tracing::info!(removed, "swept leftover pinned handles");
        }
    }
}

impl Drop for ProbeAttacher {
    fn drop(&mut self) {
        if self.bpf.is_some() || !self.links.is_empty() {
            self.detach_all();
        }
    }
}
