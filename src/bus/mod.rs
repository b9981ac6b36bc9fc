// Puck registry for one CAN bus
//
// Provides:
// - Discovery: wake, classify and register every puck on the bus
// - Per-firmware property tables (props.rs)
// - Packed position/acceleration sampling with plausibility checks
// - Packed torque output per broadcast group

pub mod props;
mod puck;
mod slots;

use std::thread::sleep;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::can::frame::WHOLE_ARM;
use crate::can::{CanDevice, CanError, Destination, STAT_INDEX};
use crate::config::{
    BusConfig, BusTiming, MAX_ACCELERATION_JUMP, MAX_POSITION_JUMP, SAFETY_PUCK_ID,
};

pub use props::{Property, PropertyTable, UnknownProperty};
pub use puck::{ControlMode, Group, Puck, PuckStatus, SafetyPuck, ROLE_ABSOLUTE_ENCODER};
pub use slots::Slots;

/// VERS is index 0 in every firmware layout
const VERS_INDEX: u8 = 0;

/// What each [`Bus::update`] samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePolicy {
    /// Positions only
    PositionOnly,
    /// Positions, then velocity by differentiation
    PositionDiff,
    /// Alternate: accelerations on odd updates, positions + velocity on even
    AccelerationPosition,
}

/// Error types for the puck registry
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Bus port configuration: {reason}")]
    PortConfig { reason: String },

    #[error("More than one safety puck found (second at ID {id})")]
    DuplicateSafetyPuck { id: u8 },

    #[error("The safety module (ID {id}) is not functioning properly: status {status}")]
    SafetyPuckNotReady { id: u8, status: i64 },

    #[error("No pucks responded on port {port}")]
    NoPucks { port: u32 },

    #[error("Puck {id} reports GRPB={group} PIDX={pidx}, not a valid group slot")]
    BadGroupSlot { id: u8, group: i64, pidx: i64 },

    #[error("Puck {id} reports {counts} counts per revolution")]
    InvalidCounts { id: u8, counts: i64 },

    #[error("Property index {index} is beyond the end of the table ({end})")]
    PropertyOutOfRange { index: u8, end: u8 },

    #[error("Property {property} does not exist in firmware {firmware}")]
    UnsupportedProperty { property: Property, firmware: i64 },

    #[error("CAN error: {0}")]
    Can(#[from] CanError),
}

pub type Result<T> = std::result::Result<T, BusError>;

/// All pucks on one CAN bus.
///
/// Fields are declared so that the registry drops before the device it was
/// discovered on.
pub struct Bus {
    pucks: Slots<Puck>,
    groups: Slots<Group>,
    safety_puck: Option<SafetyPuck>,
    props: PropertyTable,

    policy: UpdatePolicy,
    check_acceleration_jumps: bool,
    first_position: bool,
    first_acceleration: bool,
    update_count: u64,
    last_position_sample: Option<Instant>,

    timing: BusTiming,
    port: u32,
    device: CanDevice,
}

impl Bus {
    /// Open the configured CAN port and discover its pucks
    pub fn create(config: &BusConfig, policy: UpdatePolicy) -> Result<Self> {
        let port = port_number(config)?;
        let device = CanDevice::open(config.adapter, port, config.device.as_deref())?;
        info!("Opened CAN port {} ({})", port, device.name());
        Self::with_device(device, config, policy)
    }

    /// Discover pucks on an already-open device
    pub fn with_device(device: CanDevice, config: &BusConfig, policy: UpdatePolicy) -> Result<Self> {
        let port = port_number(config)?;
        let timing = config.timing.clone();
        let found = discover(&device, port, &timing)?;

        Ok(Self {
            pucks: found.pucks,
            groups: found.groups,
            safety_puck: found.safety_puck,
            props: found.props,
            policy,
            check_acceleration_jumps: config.check_acceleration_jumps,
            first_position: true,
            first_acceleration: true,
            update_count: 0,
            last_position_sample: None,
            timing,
            port,
            device,
        })
    }

    /// Sample the pucks according to the update policy
    pub fn update(&mut self) -> Result<()> {
        self.update_at(Instant::now())
    }

    /// [`Bus::update`] with an explicit sample time
    pub fn update_at(&mut self, now: Instant) -> Result<()> {
        self.device.clear_pending()?;

        match self.policy {
            UpdatePolicy::PositionOnly => {
                self.retrieve_positions()?;
            }
            UpdatePolicy::PositionDiff => {
                let accepted = self.retrieve_positions()?;
                self.differentiate(&accepted, now);
            }
            UpdatePolicy::AccelerationPosition => {
                if self.update_count % 2 == 1 {
                    self.retrieve_accelerations()?;
                } else {
                    let accepted = self.retrieve_positions()?;
                    self.differentiate(&accepted, now);
                }
            }
        }

        self.update_count += 1;
        Ok(())
    }

    /// Fetch packed positions. Returns the IDs whose sample was accepted.
    fn retrieve_positions(&mut self) -> Result<Vec<usize>> {
        let index = self.index(Property::Ap)?;
        let mut data = vec![None; self.pucks.len()];
        self.device
            .get_packed(WHOLE_ARM, self.pucks.occupied(), index, &mut data)?;

        let first = self.first_position;
        let mut accepted = Vec::with_capacity(data.len());
        for (id, puck) in self.pucks.iter_mut() {
            let Some(raw) = data[id].map(i64::from) else {
                warn!("Puck {} invalid position: no sample", id);
                continue;
            };
            if !first && (raw - puck.raw_position).abs() > MAX_POSITION_JUMP {
                warn!(
                    "Puck {} insane position diff: {}",
                    id,
                    raw - puck.raw_position
                );
                continue;
            }
            puck.raw_position = raw;
            puck.position_last = puck.position;
            puck.position = puck.counts_to_rad(raw);
            accepted.push(id);
        }

        self.first_position = false;
        Ok(accepted)
    }

    /// Fetch packed accelerations (the pucks answer MECH with it)
    fn retrieve_accelerations(&mut self) -> Result<()> {
        let index = self.index(Property::Mech)?;
        let mut data = vec![None; self.pucks.len()];
        self.device
            .get_packed(WHOLE_ARM, self.pucks.occupied(), index, &mut data)?;

        let check = self.check_acceleration_jumps && !self.first_acceleration;
        for (id, puck) in self.pucks.iter_mut() {
            let Some(raw) = data[id].map(i64::from) else {
                warn!("Puck {} invalid acceleration: no sample", id);
                continue;
            };
            if check && (raw - puck.raw_acceleration).abs() > MAX_ACCELERATION_JUMP {
                warn!(
                    "Puck {} insane acceleration diff: {}",
                    id,
                    raw - puck.raw_acceleration
                );
                continue;
            }
            puck.raw_acceleration = raw;
            puck.acceleration = puck.acceleration_from_raw(raw);
        }

        self.first_acceleration = false;
        Ok(())
    }

    /// Velocity over the interval since the previous position sample.
    /// Pucks whose sample was rejected keep their previous velocity.
    fn differentiate(&mut self, accepted: &[usize], now: Instant) {
        let dt = self
            .last_position_sample
            .map(|last| now.saturating_duration_since(last).as_secs_f64())
            .filter(|dt| *dt > 0.0);

        for &id in accepted {
            if let Some(puck) = self.pucks.get_mut(id) {
                puck.velocity_last = puck.velocity;
                puck.velocity = match dt {
                    Some(dt) => (puck.position - puck.position_last) / dt,
                    None => 0.0,
                };
            }
        }
        self.last_position_sample = Some(now);
    }

    /// Send every puck's torque, one packed frame per group
    pub fn set_torques(&mut self) -> Result<()> {
        let index = self.index(Property::T)?;

        for (_, puck) in self.pucks.iter_mut() {
            puck.raw_torque = puck.torque_to_raw();
        }

        for (gid, group) in self.groups.iter() {
            let values = group.slots().map(|slot| {
                slot.and_then(|id| self.pucks.get(id as usize))
                    .map_or(0, |p| p.raw_torque)
            });
            self.device.set_torques(gid as u8, values, index)?;
        }
        Ok(())
    }

    /// Read a property from one puck
    pub fn get_property(&self, id: u8, property: Property) -> Result<i64> {
        self.get_property_raw(id, self.index(property)?)
    }

    /// Read a property by raw index
    pub fn get_property_raw(&self, id: u8, index: u8) -> Result<i64> {
        self.check_index(index)?;
        Ok(self.device.get_property(id, index)?)
    }

    /// Write a property to a puck or group
    pub fn set_property(
        &self,
        destination: impl Into<Destination>,
        property: Property,
        value: i64,
        verify: bool,
    ) -> Result<()> {
        self.set_property_raw(destination, self.index(property)?, value, verify)
    }

    /// Write a property by raw index
    pub fn set_property_raw(
        &self,
        destination: impl Into<Destination>,
        index: u8,
        value: i64,
        verify: bool,
    ) -> Result<()> {
        self.check_index(index)?;
        Ok(self
            .device
            .set_property(destination.into(), index, value, verify)?)
    }

    /// Drain stray inbound frames
    pub fn clear_pending(&self) -> Result<usize> {
        Ok(self.device.clear_pending()?)
    }

    /// Index of `property` in this bus's firmware layout
    pub fn index(&self, property: Property) -> Result<u8> {
        index_of(&self.props, property)
    }

    fn check_index(&self, index: u8) -> Result<()> {
        if index >= self.props.prop_end() {
            return Err(BusError::PropertyOutOfRange {
                index,
                end: self.props.prop_end(),
            });
        }
        Ok(())
    }

    pub fn puck(&self, id: u8) -> Option<&Puck> {
        self.pucks.get(id as usize)
    }

    pub fn puck_mut(&mut self, id: u8) -> Option<&mut Puck> {
        self.pucks.get_mut(id as usize)
    }

    pub fn pucks(&self) -> &Slots<Puck> {
        &self.pucks
    }

    pub fn groups(&self) -> &Slots<Group> {
        &self.groups
    }

    pub fn safety_puck(&self) -> Option<SafetyPuck> {
        self.safety_puck
    }

    pub fn properties(&self) -> &PropertyTable {
        &self.props
    }

    pub fn policy(&self) -> UpdatePolicy {
        self.policy
    }

    pub fn timing(&self) -> &BusTiming {
        &self.timing
    }

    pub fn port(&self) -> u32 {
        self.port
    }

    pub fn device(&self) -> &CanDevice {
        &self.device
    }

    pub fn update_count(&self) -> u64 {
        self.update_count
    }
}

fn port_number(config: &BusConfig) -> Result<u32> {
    let port = config.port.ok_or_else(|| BusError::PortConfig {
        reason: "no port".to_string(),
    })?;
    u32::try_from(port).map_err(|_| BusError::PortConfig {
        reason: format!("port {} out of range", port),
    })
}

fn index_of(props: &PropertyTable, property: Property) -> Result<u8> {
    props
        .get(property)
        .ok_or(BusError::UnsupportedProperty {
            property,
            firmware: props.firmware(),
        })
}

struct Discovered {
    pucks: Slots<Puck>,
    groups: Slots<Group>,
    safety_puck: Option<SafetyPuck>,
    props: PropertyTable,
}

/// Wake the arm, then walk every node ID and register what answers
fn discover(device: &CanDevice, port: u32, timing: &BusTiming) -> Result<Discovered> {
    info!("Waking all pucks");
    device.set_property(
        Destination::Group(WHOLE_ARM),
        STAT_INDEX,
        PuckStatus::Ready as i64,
        false,
    )?;
    sleep(timing.wake_settle());

    let mut props: Option<PropertyTable> = None;
    let mut safety_puck = None;
    let mut pucks = Slots::new();
    let mut groups: Slots<Group> = Slots::new();

    for node in device.scan(timing.probe_wait()) {
        let (id, status) = node?;

        if id == SAFETY_PUCK_ID {
            register_safety_puck(&mut safety_puck, id, status)?;
            learn_layout(&mut props, device, id)?;
            continue;
        }

        match PuckStatus::from_raw(status) {
            Some(PuckStatus::Reset | PuckStatus::Ready) => {
                if status == PuckStatus::Reset as i64 {
                    info!("Waking puck {}", id);
                    device.set_property(
                        Destination::Node(id),
                        STAT_INDEX,
                        PuckStatus::Ready as i64,
                        false,
                    )?;
                    sleep(timing.wake_settle());
                }
                let table = learn_layout(&mut props, device, id)?;
                let puck = read_puck(device, table, id, timing)?;
                let gid = puck.group() as usize;
                if let Some(other) = groups.get(gid).and_then(|g| g.slot(puck.order())) {
                    warn!(
                        "Puck {} replaces puck {} in group {} slot {}",
                        id,
                        other,
                        gid,
                        puck.order()
                    );
                }
                if !groups.contains(gid) {
                    groups.set(gid, Group::default());
                }
                if let Some(group) = groups.get_mut(gid) {
                    group.assign(puck.order(), id);
                }
                pucks.set(id as usize, puck);
            }
            Some(PuckStatus::Err) => {
                warn!("Puck {} reports an error status, skipping it", id);
            }
            _ => debug!("Node {} status {} ignored", id, status),
        }
    }

    let props = props.ok_or(BusError::NoPucks { port })?;
    if safety_puck.is_none() {
        warn!("No safety puck found on port {}", port);
    }
    info!(
        "Found {} pucks in {} groups on port {}",
        pucks.occupied(),
        groups.occupied(),
        port
    );

    Ok(Discovered {
        pucks,
        groups,
        safety_puck,
        props,
    })
}

/// The first awake puck decides the property layout for the whole bus
fn learn_layout<'a>(
    props: &'a mut Option<PropertyTable>,
    device: &CanDevice,
    id: u8,
) -> Result<&'a PropertyTable> {
    let table = match props.take() {
        Some(table) => table,
        None => {
            let vers = device.get_property(id, VERS_INDEX)?;
            info!("Property layout from puck {} firmware {}", id, vers);
            PropertyTable::for_firmware(vers)
        }
    };
    Ok(props.insert(table))
}

/// Record the safety module, refusing a second one or one that is not ready
pub fn register_safety_puck(slot: &mut Option<SafetyPuck>, id: u8, status: i64) -> Result<()> {
    if slot.is_some() {
        return Err(BusError::DuplicateSafetyPuck { id });
    }
    if status != PuckStatus::Ready as i64 {
        return Err(BusError::SafetyPuckNotReady { id, status });
    }
    info!("Found a safety puck (ID {})", id);
    *slot = Some(SafetyPuck { id });
    Ok(())
}

/// Idle a puck and read its identity
fn read_puck(device: &CanDevice, props: &PropertyTable, id: u8, timing: &BusTiming) -> Result<Puck> {
    let get = |property: Property| -> Result<i64> { Ok(device.get_property(id, index_of(props, property)?)?) };

    device.set_property(
        Destination::Node(id),
        index_of(props, Property::Mode)?,
        ControlMode::Idle as i64,
        false,
    )?;
    sleep(timing.mode_settle());

    let vers = get(Property::Vers)?;
    let role = get(Property::Role)?;
    let counts = get(Property::Cts)?;
    let ipnm = get(Property::Ipnm)?;
    let pidx = get(Property::Pidx)?;
    let grpb = get(Property::Grpb)?;

    if counts <= 0 {
        return Err(BusError::InvalidCounts { id, counts });
    }
    let bad_slot = || BusError::BadGroupSlot {
        id,
        group: grpb,
        pidx,
    };
    if !(1..=Group::SIZE as i64).contains(&pidx) {
        return Err(bad_slot());
    }
    let group = u8::try_from(grpb)
        .ok()
        .filter(|g| *g < 32)
        .ok_or_else(bad_slot)?;

    info!(
        "Puck: ID={} VERS={} CTS={} IPNM={} PIDX={} GRPB={}",
        id, vers, counts, ipnm, pidx, grpb
    );
    Ok(Puck::new(
        id,
        vers,
        role,
        counts,
        ipnm as f64,
        group,
        (pidx - 1) as usize,
    ))
}
