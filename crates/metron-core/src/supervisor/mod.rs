//! The master process: spawns the role children, then turns every
//! delivered signal into one pass of the supervision loop.
//!
//! A child that crashes is respawned in the same pass that reaped it. A
//! fast shutdown (TERM/INT) escalates: children get SIGTERM, then after a
//! doubling delay starting at 50 ms a re-check, and past 1000 ms SIGKILL.
//! A graceful quit (QUIT) signals children once and waits them out. USR2
//! swaps the binary: the pidfile moves aside, the new binary starts
//! detached from our own argv, and the old master quits gracefully in the
//! same pass.

pub mod control;
pub mod signals;

pub use control::{ChildSignal, ExitKind, ProcessControl, SignalError, SystemControl};
pub use signals::{MasterSignals, ShutdownFlags, SignalEvent, install_child_signals};

use std::ops::ControlFlow;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::logging::LogWriter;
use crate::pidfile::PidFile;

/// Role of a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Agent,
    Update,
    Worker,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Agent => "agent",
            Role::Update => "update",
            Role::Worker => "worker",
        }
    }

    pub fn process_name(&self) -> &'static str {
        match self {
            Role::Agent => "agent process",
            Role::Update => "update process",
            Role::Worker => "worker process",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent" => Ok(Role::Agent),
            "update" => Ok(Role::Update),
            "worker" => Ok(Role::Worker),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnPolicy {
    NoRespawn,
    Respawn,
}

struct ProcessSlot {
    /// `None` after a failed respawn.
    pid: Option<u32>,
    role: Role,
    policy: SpawnPolicy,
    /// We asked this child to exit.
    exiting: bool,
    exited: bool,
}

pub struct Supervisor<C: ProcessControl> {
    control: C,
    slots: Vec<ProcessSlot>,
    pidfile: Option<PidFile>,
    log: LogWriter,
    terminate: bool,
    quit: bool,
    change_binary: bool,
    sigalrm: bool,
    reap: bool,
    /// Escalation delay in milliseconds; 0 means not escalating.
    delay: u64,
    /// Any slot still running.
    live: bool,
    /// Pid of a detached hot-swap master; sticky for our remaining life.
    new_binary: Option<u32>,
}

impl<C: ProcessControl> Supervisor<C> {
    pub fn new(control: C, pidfile: Option<PidFile>, log: LogWriter) -> Self {
        Self {
            control,
            slots: Vec::new(),
            pidfile,
            log,
            terminate: false,
            quit: false,
            change_binary: false,
            sigalrm: false,
            reap: false,
            delay: 0,
            live: false,
            new_binary: None,
        }
    }

    /// Spawns a child and registers its slot. Startup failures are fatal.
    pub fn add_child(&mut self, role: Role, policy: SpawnPolicy) -> std::io::Result<()> {
        let pid = self.control.spawn(role)?;
        info!("started {} {}", role.process_name(), pid);
        self.slots.push(ProcessSlot {
            pid: Some(pid),
            role,
            policy,
            exiting: false,
            exited: false,
        });
        self.live = true;
        Ok(())
    }

    /// Runs the supervision loop until an orderly exit.
    pub fn run(&mut self, events: impl IntoIterator<Item = SignalEvent>) {
        let mut events = events.into_iter();
        loop {
            self.prepare_wait();
            let Some(event) = events.next() else { break };
            if self.step(event).is_break() {
                self.exit_master();
                break;
            }
        }
    }

    /// Re-arms the escalation timer before blocking for the next signal.
    fn prepare_wait(&mut self) {
        if self.delay > 0 {
            if self.sigalrm {
                self.sigalrm = false;
                self.delay *= 2;
            }
            info!("termination cycle: {}ms", self.delay);
            self.control.arm_timer(Duration::from_millis(self.delay));
        }
    }

    /// Processes one wake-up of the master loop.
    fn step(&mut self, event: SignalEvent) -> ControlFlow<()> {
        match event {
            SignalEvent::Reap => self.reap = true,
            SignalEvent::Terminate => self.terminate = true,
            SignalEvent::Quit => self.quit = true,
            SignalEvent::Alarm => self.sigalrm = true,
            SignalEvent::ChangeBinary => self.change_binary = true,
            SignalEvent::Reopen => {
                info!("reopening log file");
                if let Err(err) = self.log.reopen() {
                    error!("reopen log failed: {}", err);
                }
            }
        }

        if self.reap {
            self.reap = false;
            self.process_exits();
        }

        if !self.live && (self.terminate || self.quit) {
            return ControlFlow::Break(());
        }

        if self.terminate {
            if self.delay == 0 {
                self.delay = 50;
            }
            let sig = if self.delay > 1000 {
                ChildSignal::Kill
            } else {
                ChildSignal::Term
            };
            self.signal_children(sig);
            return ControlFlow::Continue(());
        }

        if self.quit {
            // A binary change requested mid-drain stays deferred; the old
            // master finishes quitting without swapping.
            self.signal_children(ChildSignal::Quit);
            return ControlFlow::Continue(());
        }

        if self.change_binary {
            self.change_binary = false;
            if self.new_binary.is_some() {
                info!("binary change already in progress, ignoring");
            } else {
                self.start_new_binary();
                if self.quit {
                    // The swap succeeded; the graceful quit it implies
                    // starts on this same wake.
                    self.signal_children(ChildSignal::Quit);
                }
            }
        }

        ControlFlow::Continue(())
    }

    /// Drains exited children, respawns crashed ones, recomputes liveness.
    fn process_exits(&mut self) {
        while let Some((pid, status)) = self.control.reap() {
            let Some(slot) = self.slots.iter_mut().find(|slot| slot.pid == Some(pid)) else {
                debug!("unknown child {} exited", pid);
                continue;
            };
            match status {
                ExitKind::Code(code) => {
                    info!("{} {} exited with code {}", slot.role.process_name(), pid, code);
                }
                ExitKind::Signal(signal) => {
                    info!("{} {} exited on signal {}", slot.role.process_name(), pid, signal);
                }
            }
            slot.exited = true;
        }

        for slot in &mut self.slots {
            // Crashes respawn; deaths we asked for (or during quit) do not.
            if !slot.exited
                || slot.policy != SpawnPolicy::Respawn
                || slot.exiting
                || self.quit
            {
                continue;
            }
            match self.control.spawn(slot.role) {
                Ok(pid) => {
                    info!("respawned {} {}", slot.role.process_name(), pid);
                    slot.pid = Some(pid);
                    slot.exited = false;
                    slot.exiting = false;
                }
                Err(err) => {
                    error!("could not respawn {}: {}", slot.role.process_name(), err);
                    slot.pid = None;
                }
            }
        }

        self.live = self.slots.iter().any(|slot| !slot.exited);
    }

    fn signal_children(&mut self, sig: ChildSignal) {
        for slot in &mut self.slots {
            let Some(pid) = slot.pid else { continue };
            if slot.exited {
                continue;
            }
            // One Term or Quit per slot; Kill goes out regardless.
            if slot.exiting && sig != ChildSignal::Kill {
                continue;
            }
            match self.control.signal(pid, sig) {
                Ok(()) => slot.exiting = true,
                Err(SignalError::Gone) => {
                    slot.exited = true;
                    slot.exiting = false;
                    self.reap = true;
                }
                Err(err) => {
                    error!("signal {} {} failed: {}", slot.role.process_name(), pid, err);
                }
            }
        }
    }

    fn start_new_binary(&mut self) {
        info!("changing binary");
        if let Some(pidfile) = self.pidfile.as_mut() {
            if let Err(err) = pidfile.rename_oldbin() {
                error!("rename pidfile failed: {}", err);
                return;
            }
        }
        match self.control.spawn_new_binary() {
            Ok(pid) => {
                info!("new binary process {}", pid);
                self.new_binary = Some(pid);
                // The new master owns the host now; quit like an operator
                // asked us to.
                self.quit = true;
            }
            Err(err) => {
                error!("spawn new binary failed: {}", err);
                if let Some(pidfile) = self.pidfile.as_mut() {
                    if let Err(err) = pidfile.restore() {
                        error!("restore pidfile failed: {}", err);
                    }
                }
            }
        }
    }

    fn exit_master(&mut self) {
        info!("exit");
        if let Some(pidfile) = self.pidfile.take() {
            pidfile.remove();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashSet, VecDeque};
    use std::io;

    #[derive(Debug, PartialEq, Eq)]
    enum Action {
        Spawn(Role, u32),
        SpawnNewBinary(u32),
        Signal(u32, ChildSignal),
        ArmTimer(u64),
    }

    #[derive(Default)]
    struct TestControl {
        next_pid: u32,
        actions: Vec<Action>,
        pending_reaps: VecDeque<(u32, ExitKind)>,
        fail_spawn: bool,
        fail_new_binary: bool,
        gone: HashSet<u32>,
    }

    impl ProcessControl for TestControl {
        fn spawn(&mut self, role: Role) -> io::Result<u32> {
            if self.fail_spawn {
                return Err(io::Error::other("spawn refused"));
            }
            self.next_pid += 1;
            self.actions.push(Action::Spawn(role, self.next_pid));
            Ok(self.next_pid)
        }

        fn spawn_new_binary(&mut self) -> io::Result<u32> {
            if self.fail_new_binary {
                return Err(io::Error::other("exec refused"));
            }
            self.next_pid += 1;
            self.actions.push(Action::SpawnNewBinary(self.next_pid));
            Ok(self.next_pid)
        }

        fn signal(&mut self, pid: u32, sig: ChildSignal) -> Result<(), SignalError> {
            self.actions.push(Action::Signal(pid, sig));
            if self.gone.contains(&pid) {
                Err(SignalError::Gone)
            } else {
                Ok(())
            }
        }

        fn reap(&mut self) -> Option<(u32, ExitKind)> {
            self.pending_reaps.pop_front()
        }

        fn arm_timer(&mut self, delay: Duration) {
            self.actions.push(Action::ArmTimer(delay.as_millis() as u64));
        }
    }

    fn supervisor() -> Supervisor<TestControl> {
        Supervisor::new(TestControl::default(), None, LogWriter::stderr())
    }

    #[test]
    fn test_crashed_child_respawns_in_the_same_pass() {
        let mut s = supervisor();
        s.add_child(Role::Agent, SpawnPolicy::Respawn).unwrap();

        s.control.pending_reaps.push_back((1, ExitKind::Signal(11)));
        assert!(s.step(SignalEvent::Reap).is_continue());

        assert_eq!(
            s.control.actions,
            vec![Action::Spawn(Role::Agent, 1), Action::Spawn(Role::Agent, 2)]
        );
        assert_eq!(s.slots[0].pid, Some(2));
        assert!(s.live);
    }

    #[test]
    fn test_no_respawn_child_stays_down() {
        let mut s = supervisor();
        s.add_child(Role::Update, SpawnPolicy::NoRespawn).unwrap();

        s.control.pending_reaps.push_back((1, ExitKind::Code(0)));
        assert!(s.step(SignalEvent::Reap).is_continue());

        assert_eq!(s.control.actions, vec![Action::Spawn(Role::Update, 1)]);
        assert!(!s.live);
    }

    #[test]
    fn test_quit_waits_children_out_then_exits() {
        let mut s = supervisor();
        s.add_child(Role::Agent, SpawnPolicy::Respawn).unwrap();
        s.add_child(Role::Worker, SpawnPolicy::Respawn).unwrap();

        assert!(s.step(SignalEvent::Quit).is_continue());
        // A second QUIT does not re-signal exiting children.
        assert!(s.step(SignalEvent::Quit).is_continue());
        let signals: Vec<_> = s
            .control
            .actions
            .iter()
            .filter(|a| matches!(a, Action::Signal(..)))
            .collect();
        assert_eq!(
            signals,
            vec![
                &Action::Signal(1, ChildSignal::Quit),
                &Action::Signal(2, ChildSignal::Quit)
            ]
        );

        // Children exit; no respawn under quit; the master breaks.
        s.control.pending_reaps.push_back((1, ExitKind::Code(0)));
        assert!(s.step(SignalEvent::Reap).is_continue());
        s.control.pending_reaps.push_back((2, ExitKind::Code(0)));
        assert!(s.step(SignalEvent::Reap).is_break());
        assert_eq!(s.control.actions.len(), 4);
    }

    #[test]
    fn test_terminate_escalates_to_kill() {
        let mut s = supervisor();
        s.add_child(Role::Agent, SpawnPolicy::Respawn).unwrap();

        assert!(s.step(SignalEvent::Terminate).is_continue());
        // The stubborn child ignores five Term rounds.
        for _ in 0..5 {
            s.prepare_wait();
            assert!(s.step(SignalEvent::Alarm).is_continue());
        }
        s.prepare_wait();
        assert!(s.step(SignalEvent::Alarm).is_continue());

        let arms: Vec<_> = s
            .control
            .actions
            .iter()
            .filter_map(|a| match a {
                Action::ArmTimer(ms) => Some(*ms),
                _ => None,
            })
            .collect();
        assert_eq!(arms, vec![50, 100, 200, 400, 800, 1600]);

        let signals: Vec<_> = s
            .control
            .actions
            .iter()
            .filter(|a| matches!(a, Action::Signal(..)))
            .collect();
        // One Term (the slot is exiting afterwards), then Kill past 1000ms.
        assert_eq!(
            signals,
            vec![
                &Action::Signal(1, ChildSignal::Term),
                &Action::Signal(1, ChildSignal::Kill)
            ]
        );
    }

    #[test]
    fn test_signalling_a_gone_child_marks_it_reaped() {
        let mut s = supervisor();
        s.add_child(Role::Agent, SpawnPolicy::Respawn).unwrap();
        s.control.gone.insert(1);

        assert!(s.step(SignalEvent::Quit).is_continue());
        assert!(s.slots[0].exited);
        // The scheduled reap pass finds nothing to drain but recomputes
        // liveness, and the master can exit.
        assert!(s.step(SignalEvent::Reap).is_break());
    }

    #[test]
    fn test_respawn_failure_leaves_slot_empty() {
        let mut s = supervisor();
        s.add_child(Role::Agent, SpawnPolicy::Respawn).unwrap();

        s.control.fail_spawn = true;
        s.control.pending_reaps.push_back((1, ExitKind::Code(3)));
        assert!(s.step(SignalEvent::Reap).is_continue());

        assert!(s.slots[0].pid.is_none());
        assert!(!s.live);
    }

    #[test]
    fn test_unknown_pid_reap_is_ignored() {
        let mut s = supervisor();
        s.add_child(Role::Agent, SpawnPolicy::Respawn).unwrap();

        s.control.pending_reaps.push_back((99, ExitKind::Code(0)));
        assert!(s.step(SignalEvent::Reap).is_continue());
        assert!(s.live);
        assert_eq!(s.control.actions, vec![Action::Spawn(Role::Agent, 1)]);
    }

    #[test]
    fn test_hot_swap_quits_old_master_same_pass() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrond.pid");
        let pidfile = PidFile::create(&path).unwrap();

        let mut s = Supervisor::new(TestControl::default(), Some(pidfile), LogWriter::stderr());
        s.add_child(Role::Agent, SpawnPolicy::Respawn).unwrap();

        assert!(s.step(SignalEvent::ChangeBinary).is_continue());
        assert!(!path.exists());
        assert!(dir.path().join("metrond.pid.oldbin").exists());
        assert_eq!(
            s.control.actions[1..],
            [
                Action::SpawnNewBinary(2),
                Action::Signal(1, ChildSignal::Quit)
            ]
        );

        // Repeated USR2 is ignored while the swap child is outstanding.
        assert!(s.step(SignalEvent::ChangeBinary).is_continue());
        assert_eq!(s.control.actions.len(), 3);

        // The detached pid has no slot: the agent exiting is enough.
        s.control.pending_reaps.push_back((1, ExitKind::Code(0)));
        assert!(s.step(SignalEvent::Reap).is_break());
    }

    #[test]
    fn test_change_binary_during_quit_is_deferred() {
        let mut s = supervisor();
        s.add_child(Role::Agent, SpawnPolicy::Respawn).unwrap();

        assert!(s.step(SignalEvent::Quit).is_continue());
        // USR2 mid-drain must not spawn the new binary.
        assert!(s.step(SignalEvent::ChangeBinary).is_continue());
        assert_eq!(
            s.control.actions,
            vec![
                Action::Spawn(Role::Agent, 1),
                Action::Signal(1, ChildSignal::Quit)
            ]
        );
        assert!(s.new_binary.is_none());

        // The drain finishes as if the USR2 never arrived.
        s.control.pending_reaps.push_back((1, ExitKind::Code(0)));
        assert!(s.step(SignalEvent::Reap).is_break());
    }

    #[test]
    fn test_failed_swap_restores_pidfile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrond.pid");
        let pidfile = PidFile::create(&path).unwrap();

        let mut s = Supervisor::new(TestControl::default(), Some(pidfile), LogWriter::stderr());
        s.add_child(Role::Agent, SpawnPolicy::Respawn).unwrap();
        s.control.fail_new_binary = true;

        assert!(s.step(SignalEvent::ChangeBinary).is_continue());
        assert!(path.exists());
        assert!(!dir.path().join("metrond.pid.oldbin").exists());
        assert!(!s.quit);

        // The swap can be retried once the failure is resolved.
        s.control.fail_new_binary = false;
        assert!(s.step(SignalEvent::ChangeBinary).is_continue());
        assert!(s.quit);
        assert!(!path.exists());
    }

    #[test]
    fn test_run_drives_events_to_exit() {
        let mut s = supervisor();
        s.add_child(Role::Agent, SpawnPolicy::Respawn).unwrap();
        s.control.gone.insert(1);

        s.run([SignalEvent::Quit, SignalEvent::Reap]);
        assert!(!s.live);
    }
}
