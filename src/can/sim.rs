// Simulated WAM CAN bus.
//
// Answers the Puck property protocol in-process: GET and SET by node or
// group, packed position/acceleration replies and packed torque commands.
// Cloning a SimBus shares its state, so a test can hand one clone to a
// CanDevice and keep another to inspect and drive the simulated pucks.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use super::adapter::CanAdapter;
use super::frame::{self, Frame, GROUP_FLAG, SET_BIT, WHOLE_ARM};
use super::{CanError, Result, STAT_INDEX};
use crate::bus::props::{Property, PropertyTable};

const STATUS_RESET: i64 = 0;
const STATUS_READY: i64 = 2;

/// ID the safety module answers on
pub const SIM_SAFETY_ID: u8 = 10;

/// Firmware version simulated motor pucks report unless told otherwise
pub const SIM_FIRMWARE: i64 = 130;

/// One simulated puck: a property store indexed the way its firmware is
#[derive(Debug, Clone)]
pub struct SimPuck {
    id: u8,
    table: PropertyTable,
    values: BTreeMap<u8, i64>,
    read_only: BTreeSet<u8>,
    safety: bool,
    deaf_to_broadcast_wake: bool,
}

impl SimPuck {
    /// Motor puck with current firmware, ready, in torque group 1 or 2
    /// by ID
    pub fn motor(id: u8) -> Self {
        Self::motor_with_firmware(id, SIM_FIRMWARE)
    }

    pub fn motor_with_firmware(id: u8, vers: i64) -> Self {
        let group = if id <= 4 { 1 } else { 2 };
        let order = (id.max(1) as i64 - 1) % 4 + 1;
        Self::blank(id, vers, false)
            .with(Property::Role, 0x100)
            .with(Property::Cts, 4096)
            .with(Property::Ipnm, 2700)
            .with(Property::Grpc, 3)
            .with(Property::Grpb, group)
            .with(Property::Pidx, order)
    }

    /// Safety module at ID 10
    pub fn safety() -> Self {
        Self::blank(SIM_SAFETY_ID, SIM_FIRMWARE, true)
            .with(Property::Role, 2)
            .with(Property::Zero, 0)
    }

    fn blank(id: u8, vers: i64, safety: bool) -> Self {
        let mut puck = Self {
            id,
            table: PropertyTable::for_firmware(vers),
            values: BTreeMap::new(),
            read_only: BTreeSet::new(),
            safety,
            deaf_to_broadcast_wake: false,
        };
        puck.set(Property::Vers, vers);
        puck.set(Property::Stat, STATUS_READY);
        puck
    }

    /// Builder form of [`SimPuck::set`]
    pub fn with(mut self, property: Property, value: i64) -> Self {
        self.set(property, value);
        self
    }

    pub fn with_status(self, status: i64) -> Self {
        self.with(Property::Stat, status)
    }

    /// Absolute position (AP)
    pub fn with_position(self, counts: i64) -> Self {
        self.with(Property::Ap, counts)
    }

    pub fn with_mech(self, counts: i64) -> Self {
        self.with(Property::Mech, counts)
    }

    /// Torque group (GRPB)
    pub fn with_group(self, group: i64) -> Self {
        self.with(Property::Grpb, group)
    }

    /// Slot within the torque group, 1-based (PIDX)
    pub fn with_order(self, pidx: i64) -> Self {
        self.with(Property::Pidx, pidx)
    }

    pub fn with_ipnm(self, ipnm: i64) -> Self {
        self.with(Property::Ipnm, ipnm)
    }

    pub fn with_counts_per_rev(self, cts: i64) -> Self {
        self.with(Property::Cts, cts)
    }

    /// Silently drop writes to a raw property index
    pub fn read_only(mut self, index: u8) -> Self {
        self.read_only.insert(index);
        self
    }

    /// Stay in reset when READY is broadcast to the whole arm; only a
    /// STAT write addressed to this puck wakes it
    pub fn ignoring_broadcast_wake(mut self) -> Self {
        self.deaf_to_broadcast_wake = true;
        self
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn is_safety(&self) -> bool {
        self.safety
    }

    /// Value of a symbolic property, if this firmware has it
    pub fn get(&self, property: Property) -> Option<i64> {
        self.table.get(property).map(|index| self.raw(index))
    }

    pub fn set(&mut self, property: Property, value: i64) {
        if let Some(index) = self.table.get(property) {
            self.values.insert(index, value);
        }
    }

    pub fn status(&self) -> i64 {
        self.raw(STAT_INDEX)
    }

    pub fn position(&self) -> i64 {
        self.get(Property::Ap).unwrap_or_default()
    }

    pub fn mech(&self) -> i64 {
        self.get(Property::Mech).unwrap_or_default()
    }

    /// Last torque command received, in puck current units
    pub fn torque(&self) -> i64 {
        self.get(Property::T).unwrap_or_default()
    }

    fn raw(&self, index: u8) -> i64 {
        self.values.get(&index).copied().unwrap_or_default()
    }

    fn listens_to(&self, group: u8) -> bool {
        group == WHOLE_ARM
            || [Property::Grpa, Property::Grpb, Property::Grpc]
                .into_iter()
                .any(|p| self.get(p) == Some(group as i64))
    }

    fn is_packed(&self, index: u8) -> bool {
        !self.safety
            && (self.table.get(Property::Ap) == Some(index)
                || self.table.get(Property::Mech) == Some(index))
    }

    /// Answer a GET. `group` is set when the request was broadcast.
    fn reply(&self, index: u8, group: Option<u8>) -> Result<Option<Frame>> {
        if self.status() == STATUS_RESET && index != STAT_INDEX {
            return Ok(None);
        }
        let value = self.raw(index);
        match group {
            Some(_) if self.safety => Ok(None),
            Some(_) if self.is_packed(index) => Ok(Some(Frame::new(
                frame::packed_reply_address(self.id),
                &frame::encode_packed(value as i32),
            )?)),
            _ => Ok(Some(Frame::new(
                frame::reply_address(self.id),
                &frame::encode_set(index, value),
            )?)),
        }
    }

    fn write(&mut self, index: u8, value: i64, broadcast: bool) {
        if index == STAT_INDEX {
            if value == STATUS_READY
                && self.status() == STATUS_RESET
                && !(broadcast && self.deaf_to_broadcast_wake)
            {
                self.values.insert(STAT_INDEX, STATUS_READY);
            }
            return;
        }
        if self.status() == STATUS_RESET || self.read_only.contains(&index) {
            return;
        }
        self.values.insert(index, value);
    }

    fn command_torque(&mut self, group: u8, index: u8, values: [i32; 4]) {
        if self.safety
            || self.get(Property::Grpb) != Some(group as i64)
            || self.table.get(Property::T) != Some(index)
        {
            return;
        }
        let slot = self.get(Property::Pidx).unwrap_or_default() - 1;
        if let Some(&torque) = usize::try_from(slot).ok().and_then(|s| values.get(s)) {
            self.values.insert(index, torque as i64);
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    pucks: BTreeMap<u8, SimPuck>,
    inbox: VecDeque<Frame>,
    sent: Vec<Frame>,
}

impl SimState {
    fn handle(&mut self, frame: &Frame) -> Result<()> {
        let data = frame.data();
        let Some(&head) = data.first() else {
            return Ok(());
        };
        let index = head & 0x7F;
        let group = (frame.id() & GROUP_FLAG != 0).then_some((frame.id() & 0x1F) as u8);
        let node = (frame.id() & 0x1F) as u8;

        let targets = self.pucks.values_mut().filter(|p| match group {
            Some(g) => p.listens_to(g),
            None => p.id == node,
        });

        if head & SET_BIT == 0 {
            let mut replies = Vec::new();
            for puck in targets {
                if let Some(reply) = puck.reply(index, group)? {
                    replies.push(reply);
                }
            }
            self.inbox.extend(replies);
        } else if let (Some(g), Ok(packed)) = (group, <[u8; 8]>::try_from(data)) {
            let values = frame::unpack_torques(&packed);
            for puck in targets {
                puck.command_torque(g, index, values);
            }
        } else {
            let value = frame::decode_value(data.get(2..).unwrap_or_default());
            let broadcast = group == Some(WHOLE_ARM);
            for puck in targets {
                puck.write(index, value, broadcast);
            }
        }
        Ok(())
    }
}

/// Shared handle on a simulated bus; implements [`CanAdapter`]
#[derive(Debug, Clone, Default)]
pub struct SimBus {
    state: Arc<Mutex<SimState>>,
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A WAM with `dof` motor pucks (IDs 1..=dof) and a safety module
    pub fn wam(dof: u8) -> Self {
        let bus = (1..=dof).fold(Self::new(), |bus, id| bus.with_puck(SimPuck::motor(id)));
        bus.with_puck(SimPuck::safety())
    }

    pub fn with_puck(self, puck: SimPuck) -> Self {
        self.add_puck(puck);
        self
    }

    pub fn add_puck(&self, puck: SimPuck) {
        self.lock().pucks.insert(puck.id, puck);
    }

    /// Snapshot of one puck
    pub fn puck(&self, id: u8) -> Option<SimPuck> {
        self.lock().pucks.get(&id).cloned()
    }

    pub fn set(&self, id: u8, property: Property, value: i64) {
        if let Some(puck) = self.lock().pucks.get_mut(&id) {
            puck.set(property, value);
        }
    }

    pub fn set_position(&self, id: u8, counts: i64) {
        self.set(id, Property::Ap, counts);
    }

    pub fn set_mech(&self, id: u8, counts: i64) {
        self.set(id, Property::Mech, counts);
    }

    /// Last torque command received by a puck
    pub fn torque(&self, id: u8) -> Option<i64> {
        self.puck(id).map(|p| p.torque())
    }

    /// Queue an unsolicited inbound frame
    pub fn inject(&self, frame: Frame) {
        self.lock().inbox.push_back(frame);
    }

    /// Every frame written by the host so far
    pub fn sent_frames(&self) -> Vec<Frame> {
        self.lock().sent.clone()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CanAdapter for SimBus {
    fn read_frame(&mut self, blocking: bool) -> Result<Option<Frame>> {
        match self.lock().inbox.pop_front() {
            Some(frame) => Ok(Some(frame)),
            None if blocking => Err(CanError::Timeout),
            None => Ok(None),
        }
    }

    fn write_frame(&mut self, frame: &Frame, _blocking: bool) -> Result<()> {
        trace!("sim <- {:?}", frame);
        let mut state = self.lock();
        state.sent.push(*frame);
        state.handle(frame)
    }

    fn describe(&self) -> String {
        format!("simulated bus ({} pucks)", self.lock().pucks.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::Destination;

    fn send(sim: &mut SimBus, destination: Destination, payload: &[u8]) {
        let frame = Frame::new(destination.address(), payload).unwrap();
        sim.write_frame(&frame, true).unwrap();
    }

    #[test]
    fn test_wam_preset() {
        let sim = SimBus::wam(7);
        assert_eq!(sim.puck(4).unwrap().get(Property::Grpb), Some(1));
        assert_eq!(sim.puck(5).unwrap().get(Property::Grpb), Some(2));
        assert_eq!(sim.puck(7).unwrap().get(Property::Pidx), Some(3));
        assert!(sim.puck(10).unwrap().is_safety());
        assert!(sim.puck(8).is_none());
    }

    #[test]
    fn test_reset_puck_only_answers_stat() {
        let mut sim = SimBus::new().with_puck(SimPuck::motor(1).with_status(0));
        send(&mut sim, Destination::Node(1), &frame::encode_get(48));
        assert!(sim.read_frame(false).unwrap().is_none());
        send(&mut sim, Destination::Node(1), &frame::encode_get(STAT_INDEX));
        assert!(sim.read_frame(false).unwrap().is_some());
    }

    #[test]
    fn test_broadcast_wake() {
        let mut sim = SimBus::new()
            .with_puck(SimPuck::motor(1).with_status(0))
            .with_puck(SimPuck::motor(2).with_status(0).ignoring_broadcast_wake());
        send(
            &mut sim,
            Destination::Group(WHOLE_ARM),
            &frame::encode_set(STAT_INDEX, 2),
        );
        assert_eq!(sim.puck(1).unwrap().status(), 2);
        assert_eq!(sim.puck(2).unwrap().status(), 0);

        send(&mut sim, Destination::Node(2), &frame::encode_set(STAT_INDEX, 2));
        assert_eq!(sim.puck(2).unwrap().status(), 2);
    }

    #[test]
    fn test_torque_frame_reaches_group_members() {
        let mut sim = SimBus::wam(7);
        send(
            &mut sim,
            Destination::Group(2),
            &frame::pack_torques(42, [10, 20, 30, 0]),
        );
        assert_eq!(sim.torque(5), Some(10));
        assert_eq!(sim.torque(6), Some(20));
        assert_eq!(sim.torque(7), Some(30));
        assert_eq!(sim.torque(1), Some(0));
    }

    #[test]
    fn test_group_get_of_position_is_packed() {
        let mut sim = SimBus::wam(4);
        sim.set_position(2, -3);
        send(&mut sim, Destination::Group(WHOLE_ARM), &frame::encode_get(48));

        let mut replies = Vec::new();
        while let Some(f) = sim.read_frame(false).unwrap() {
            replies.push(frame::parse(&f).unwrap());
        }
        // safety module stays silent
        assert_eq!(replies.len(), 4);
        assert!(replies.contains(&frame::Message::Packed { node: 2, value: -3 }));
    }
}
