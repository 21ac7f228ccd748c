use std::cell::Cell;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Between the client and this process.
    Local,
    /// Between this process and the destination.
    Remote,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FlowState {
    Init,
    Establishing,
    Established,
    Closing,
    Closed,
}

/// Tracks which operations a leg may legally start.
///
/// Illegal transitions are caller bugs and panic. Once the machine is forced
/// closed by [`FlowStateMachine::closed`] or [`FlowStateMachine::errored`],
/// late completions (`*_end`) are ignored. The same holds for a write that
/// finishes after `write_close_begin`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlowStateMachine {
    role: Role,
    state: FlowState,
    reading: bool,
    writing: bool,
    read_closed: bool,
    write_closing: bool,
    write_closed: bool,
    errored: bool,
}

impl FlowStateMachine {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: FlowState::Init,
            reading: false,
            writing: false,
            read_closed: false,
            write_closing: false,
            write_closed: false,
            errored: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn is_reading(&self) -> bool {
        self.reading
    }

    pub fn is_writing(&self) -> bool {
        self.writing
    }

    pub fn is_read_closed(&self) -> bool {
        self.read_closed
    }

    pub fn is_write_closing(&self) -> bool {
        self.write_closing
    }

    pub fn is_write_closed(&self) -> bool {
        self.write_closed
    }

    pub fn is_errored(&self) -> bool {
        self.errored
    }

    pub fn is_closed(&self) -> bool {
        self.state == FlowState::Closed
    }

    fn negotiating_locally(&self) -> bool {
        self.role == Role::Local && self.state == FlowState::Establishing
    }

    pub fn is_readable(&self) -> bool {
        !self.reading
            && (self.negotiating_locally()
                || self.state == FlowState::Established
                || (self.state == FlowState::Closing && !self.read_closed))
    }

    pub fn is_writable(&self) -> bool {
        !self.writing
            && (self.negotiating_locally()
                || self.state == FlowState::Established
                || (self.state == FlowState::Closing && !self.write_closed && !self.write_closing))
    }

    pub fn can_close_write(&self) -> bool {
        matches!(self.state, FlowState::Established | FlowState::Closing)
            && !self.write_closing
            && !self.write_closed
    }

    pub fn connect_begin(&mut self) {
        assert_eq!(self.state, FlowState::Init, "connect started twice");
        self.state = FlowState::Establishing;
    }

    pub fn connected(&mut self) {
        if self.is_closed() {
            return;
        }
        assert!(
            matches!(self.state, FlowState::Init | FlowState::Establishing),
            "connected in state {:?}",
            self.state
        );
        self.state = FlowState::Established;
    }

    pub fn read_begin(&mut self) {
        assert!(self.is_readable(), "read not allowed: {:?}", self);
        self.reading = true;
    }

    pub fn read_end(&mut self) {
        if self.is_closed() {
            return;
        }
        assert!(self.reading, "read_end without read_begin");
        self.reading = false;
    }

    pub fn read_closed(&mut self) {
        if self.is_closed() {
            return;
        }
        assert!(
            matches!(self.state, FlowState::Established | FlowState::Closing),
            "read closed in state {:?}",
            self.state
        );
        self.reading = false;
        self.read_closed = true;
        if self.state == FlowState::Established {
            self.state = FlowState::Closing;
        } else if self.write_closed {
            self.state = FlowState::Closed;
        }
    }

    pub fn write_begin(&mut self) {
        assert!(self.is_writable(), "write not allowed: {:?}", self);
        self.writing = true;
    }

    pub fn write_end(&mut self) {
        // a write canceled by close_write may still complete
        if self.is_closed() || self.write_closing || self.write_closed {
            return;
        }
        assert!(self.writing, "write_end without write_begin");
        self.writing = false;
    }

    pub fn write_close_begin(&mut self) {
        assert!(self.can_close_write(), "close write not allowed: {:?}", self);
        self.state = FlowState::Closing;
        self.writing = false;
        self.write_closing = true;
    }

    pub fn write_close_end(&mut self) {
        if self.is_closed() {
            return;
        }
        assert!(self.write_closing, "write_close_end without write_close_begin");
        self.write_closing = false;
        self.write_closed = true;
        if self.read_closed {
            self.state = FlowState::Closed;
        }
    }

    pub fn closed(&mut self) {
        self.reading = false;
        self.writing = false;
        self.read_closed = true;
        self.write_closing = false;
        self.write_closed = true;
        self.state = FlowState::Closed;
    }

    pub fn errored(&mut self) {
        self.closed();
        self.errored = true;
    }
}

/// Interior-mutable holder used by legs that share their state through `Rc`.
#[derive(Debug)]
pub struct FsmCell(Cell<FlowStateMachine>);

impl FsmCell {
    pub fn new(role: Role) -> Self {
        Self(Cell::new(FlowStateMachine::new(role)))
    }

    pub fn get(&self) -> FlowStateMachine {
        self.0.get()
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut FlowStateMachine) -> R) -> R {
        let mut fsm = self.0.get();
        let r = f(&mut fsm);
        self.0.set(fsm);
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn established(role: Role) -> FlowStateMachine {
        let mut fsm = FlowStateMachine::new(role);
        fsm.connect_begin();
        fsm.connected();
        fsm
    }

    #[test]
    fn only_local_legs_do_io_while_establishing() {
        let mut local = FlowStateMachine::new(Role::Local);
        local.connect_begin();
        assert!(local.is_readable() && local.is_writable());

        let mut remote = FlowStateMachine::new(Role::Remote);
        remote.connect_begin();
        assert!(!remote.is_readable() && !remote.is_writable());
    }

    #[test]
    fn one_operation_per_direction() {
        let mut fsm = established(Role::Remote);
        fsm.read_begin();
        assert!(!fsm.is_readable());
        assert!(fsm.is_writable());
        fsm.write_begin();
        assert!(!fsm.is_writable());
        fsm.read_end();
        fsm.write_end();
        assert!(fsm.is_readable() && fsm.is_writable());
    }

    #[test]
    #[should_panic]
    fn second_read_panics() {
        let mut fsm = established(Role::Remote);
        fsm.read_begin();
        fsm.read_begin();
    }

    #[test]
    #[should_panic]
    fn connect_twice_panics() {
        let mut fsm = established(Role::Local);
        fsm.connect_begin();
    }

    #[test]
    fn closes_only_when_both_sides_close() {
        let mut fsm = established(Role::Remote);
        fsm.read_begin();
        fsm.read_closed();
        assert_eq!(fsm.state(), FlowState::Closing);
        assert!(!fsm.is_readable());
        assert!(fsm.is_writable());

        fsm.write_close_begin();
        assert!(!fsm.is_writable());
        assert_eq!(fsm.state(), FlowState::Closing);
        fsm.write_close_end();
        assert_eq!(fsm.state(), FlowState::Closed);
        assert!(!fsm.is_errored());
    }

    #[test]
    fn write_side_first() {
        let mut fsm = established(Role::Local);
        fsm.write_close_begin();
        fsm.write_close_end();
        assert_eq!(fsm.state(), FlowState::Closing);
        assert!(fsm.is_readable());
        fsm.read_begin();
        fsm.read_closed();
        assert!(fsm.is_closed());
    }

    #[test]
    fn errored_forces_closed_and_ignores_late_completions() {
        let mut fsm = established(Role::Remote);
        fsm.read_begin();
        fsm.write_begin();
        fsm.errored();
        assert!(fsm.is_closed() && fsm.is_errored());
        fsm.write_end();
        fsm.read_end();
        assert!(!fsm.is_readable() && !fsm.is_writable());
    }

    #[test]
    fn state_is_monotonic() {
        let mut fsm = FlowStateMachine::new(Role::Remote);
        let mut last = fsm.state();
        let steps: [fn(&mut FlowStateMachine); 8] = [
            |m| m.connect_begin(),
            |m| m.connected(),
            |m| m.read_begin(),
            |m| m.read_end(),
            |m| m.write_begin(),
            |m| m.write_end(),
            |m| m.write_close_begin(),
            |m| m.write_close_end(),
        ];
        for step in steps {
            step(&mut fsm);
            assert!(fsm.state() >= last);
            last = fsm.state();
        }
        fsm.read_begin();
        fsm.read_closed();
        assert!(fsm.state() >= last);
        assert!(fsm.is_closed());
    }
}
