//! The callback state machine.
//!
//! The host drives everything: it fires a translation callback when it
//! translates a block, execute and memory callbacks as instrumented
//! instructions run, and syscall callbacks around each syscall.  The
//! tracer's job is to correlate those callbacks back into whole events.
//!
//! Per-event lifecycles:
//!
//! ```text
//! pc / instr:   translate ──park──▶ table ──execute──▶ submit
//! mem access:   translate ──park──▶ table ──execute──┐
//!                                        ──access───┤ both seen ▶ submit
//! syscall:      entry ──park──▶ slot ──return──▶ stamp rv ▶ submit
//! ```
//!
//! Execute and access arrive in either order, from any host thread, and
//! a callback may find its event already claimed by a racing callback;
//! absence is expected, not an error.

use std::sync::{Arc, OnceLock};

use log::{error, info, warn};

use cannonball_wire::{EventFlags, EventKind, EventRecord, NUM_SYSCALL_ARGS};

use crate::error::CoreError;
use crate::host::{HostInfo, ImageInfo, ImageSource, InsnHook, Instruction, MemInfo, TranslationBlock};
use crate::logging;
use crate::options::Options;
use crate::sender::{Sender, DEFAULT_BATCH_SIZE};
use crate::tables::{
    EventToken, MemoryTable, SyscallPut, SyscallTable, SyscallTake, TokenMint, TranslationTable,
    DEFAULT_TABLE_CAPACITY,
};

/// Protection bits reported on the program-image event.  User-mode
/// hosts map the image readable, writable and executable from the
/// plugin's point of view.
const IMAGE_PROT: u8 = 0x7;

struct TracerState {
    /// What the user asked for; written once at install.
    request: EventFlags,
    /// Program image, filled by whichever translation callback wins the
    /// first-query race.
    image: OnceLock<ImageInfo>,
    image_source: Box<dyn ImageSource>,
    mint: TokenMint,
    translations: TranslationTable,
    memory: MemoryTable,
    syscalls: SyscallTable,
    sender: Sender,
}

/// The in-process tracing core.
///
/// One `Tracer` exists per plugin load.  It is a cheap handle (shared
/// state behind an `Arc`) so the boundary adapter can clone it into
/// every host callback.
#[derive(Clone)]
pub struct Tracer {
    state: Arc<TracerState>,
}

impl Tracer {
    /// Install the tracer: parse options, bring up logging, connect to
    /// the consumer.
    ///
    /// Called once from the host's plugin-install entry point.  Any
    /// error aborts installation.
    pub fn install<S, A>(info: &HostInfo, image_source: S, args: &[A]) -> Result<Self, CoreError>
    where
        S: ImageSource + 'static,
        A: AsRef<str>,
    {
        let options = Options::parse(args)?;
        Self::install_with_options(info, image_source, &options)
    }

    /// Install with pre-parsed options.
    pub fn install_with_options<S>(
        info: &HostInfo,
        image_source: S,
        options: &Options,
    ) -> Result<Self, CoreError>
    where
        S: ImageSource + 'static,
    {
        logging::init(&options.log_file, options.log_level)?;

        if info.system_emulation {
            error!("Loaded into a system-emulation host, refusing to install");
            return Err(CoreError::SystemEmulationUnsupported);
        }

        let request = options.request_flags();
        let sender = Sender::connect(DEFAULT_BATCH_SIZE, &options.sock_path)?;

        info!(
            "Tracer installed: request={:?} sock_path={}",
            request, options.sock_path
        );

        Ok(Self {
            state: Arc::new(TracerState {
                request,
                image: OnceLock::new(),
                image_source: Box::new(image_source),
                mint: TokenMint::new(),
                translations: TranslationTable::new(DEFAULT_TABLE_CAPACITY),
                memory: MemoryTable::new(DEFAULT_TABLE_CAPACITY),
                syscalls: SyscallTable::new(info.max_vcpus),
                sender,
            }),
        })
    }

    /// Whether the adapter should register the translation callback.
    pub fn needs_translation_hook(&self) -> bool {
        self.state.request.wants_instrumentation()
    }

    /// Whether the adapter should register the syscall callback pair.
    pub fn needs_syscall_hooks(&self) -> bool {
        self.state.request.contains(EventFlags::SYSCALLS)
    }

    /// The sender, for diagnostics.
    pub fn sender(&self) -> &Sender {
        &self.state.sender
    }

    /// Translation callback: the host just translated a block of
    /// `tb.insn_count()` instructions.
    ///
    /// Emits the one-shot program-image event, then parks a scratch
    /// record per requested class per instrumented instruction and asks
    /// the host to call back when each instruction executes.
    pub fn on_translation<B: TranslationBlock>(&self, tb: &B) {
        let state = &*self.state;

        if state.image.get().is_none() {
            let image = state.image_source.image();
            // Only the winner of the race publishes and submits.
            if state.image.set(image).is_ok() {
                info!(
                    "Program image: start={:#x} end={:#x} entry={:#x}",
                    image.start_code, image.end_code, image.entry_code
                );
                state.sender.submit(&EventRecord::load(
                    image.start_code,
                    image.end_code,
                    image.entry_code,
                    IMAGE_PROT,
                ));
            }
        }

        let count = tb.insn_count();
        if count == 0 {
            return;
        }

        // Only the last instruction of a block can be a taken branch,
        // so a branch-only request skips the rest.
        let start = if state.request.is_branch_only() {
            count - 1
        } else {
            0
        };

        for index in start..count {
            let insn = match tb.insn(index) {
                Some(insn) => insn,
                None => continue,
            };
            let last = index == count - 1;
            let pc = insn.vaddr();

            let want_pc = state.request.contains(EventFlags::PC);
            let want_branch = state.request.contains(EventFlags::BRANCHES) && last;

            if want_pc || want_branch {
                let mut record = EventRecord::pc(pc, last);
                if !want_pc {
                    record.flags.remove(EventFlags::PC);
                }
                if want_branch {
                    record.flags.insert(EventFlags::BRANCHES);
                }
                self.park(record, &insn, InsnHook::Exec);
            }

            if state.request.contains(EventFlags::INSTRS) {
                let record = EventRecord::instr(pc, insn.data());
                self.park(record, &insn, InsnHook::Exec);
            }

            if state.request.contains(EventFlags::READS_WRITES) {
                // Address and direction are filled in by the access
                // callback.
                let record = EventRecord::mem_access(pc, 0, false);
                let token = state.mint.mint();
                match state.memory.insert(token, record) {
                    Ok(()) => {
                        insn.register(InsnHook::MemAccess, token);
                        insn.register(InsnHook::MemExec, token);
                    }
                    Err(err) => warn!("Dropping memory event at {:#x}: {}", pc, err),
                }
            }
        }
    }

    fn park<I: Instruction>(&self, record: EventRecord, insn: &I, hook: InsnHook) {
        let token = self.state.mint.mint();
        match self.state.translations.insert(token, record) {
            Ok(()) => insn.register(hook, token),
            Err(err) => warn!("Dropping event at {:#x}: {}", insn.vaddr(), err),
        }
    }

    /// Execute callback for a translation-table event.
    pub fn on_insn_exec(&self, _vcpu: u32, token: EventToken) {
        if let Some(record) = self.state.translations.remove(token) {
            self.state.sender.submit(&record);
        }
    }

    /// Execute callback for a memory-table event.
    pub fn on_mem_insn_exec(&self, _vcpu: u32, token: EventToken) {
        if let Some(record) = self.state.memory.observe_exec(token) {
            self.state.sender.submit(&record);
        }
    }

    /// Memory-access callback for a memory-table event.
    pub fn on_mem_access(&self, _vcpu: u32, info: MemInfo, vaddr: u64, token: EventToken) {
        if let Some(record) = self.state.memory.observe_access(token, vaddr, info.is_store) {
            self.state.sender.submit(&record);
        }
    }

    /// Syscall-entry callback.  Parks the arguments until the matching
    /// return arrives; the return value is a placeholder until then.
    pub fn on_syscall(&self, vcpu: u32, num: i64, args: [u64; NUM_SYSCALL_ARGS]) {
        let record = EventRecord::syscall(num, args);
        match self.state.syscalls.put(vcpu, record) {
            SyscallPut::Parked => {}
            SyscallPut::Evicted(prior) => {
                if let EventKind::Syscall(sys) = prior.kind {
                    warn!(
                        "VCPU {} entered syscall {} with syscall {} still pending, dropping it",
                        vcpu, num, sys.num
                    );
                }
            }
            SyscallPut::VcpuOutOfRange => {
                warn!("Syscall on out-of-range VCPU {}, dropping", vcpu);
            }
        }
    }

    /// Syscall-return callback.  Stamps the return value and submits,
    /// or reports a stale entry.
    pub fn on_syscall_ret(&self, vcpu: u32, num: i64, rv: i64) {
        match self.state.syscalls.take(vcpu, num) {
            SyscallTake::Matched(mut record) => {
                if let EventKind::Syscall(sys) = &mut record.kind {
                    sys.rv = rv;
                }
                self.state.sender.submit(&record);
            }
            SyscallTake::Mismatch { stored_num } => {
                error!(
                    "Syscall number mismatch on VCPU {}: {} != {}",
                    vcpu, stored_num, num
                );
            }
            SyscallTake::Empty => {}
        }
    }

    /// At-exit callback: the (sole, in user mode) VCPU terminated.
    /// Flushes and closes the event stream.
    pub fn on_exit(&self, vcpu: u32) {
        info!("VCPU {} exited, tearing down the event sender", vcpu);
        self.state.sender.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::unix::net::UnixListener;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;
    use std::thread;

    use bytes::BytesMut;
    use cannonball_wire::decode_record;

    struct FixedImage(ImageInfo);

    impl ImageSource for FixedImage {
        fn image(&self) -> ImageInfo {
            self.0
        }
    }

    const TEST_IMAGE: ImageInfo = ImageInfo {
        start_code: 0x40_0000,
        end_code: 0x60_0000,
        entry_code: 0x40_1000,
    };

    /// Instruction handle that records hook registrations.
    #[derive(Clone)]
    struct MockInsn {
        vaddr: u64,
        data: Vec<u8>,
        hooks: Arc<Mutex<Vec<(InsnHook, EventToken)>>>,
    }

    impl Instruction for MockInsn {
        fn vaddr(&self) -> u64 {
            self.vaddr
        }

        fn data(&self) -> &[u8] {
            &self.data
        }

        fn register(&self, hook: InsnHook, token: EventToken) {
            self.hooks.lock().unwrap().push((hook, token));
        }
    }

    struct MockBlock {
        insns: Vec<MockInsn>,
    }

    impl MockBlock {
        fn new(insns: &[(u64, &[u8])]) -> Self {
            Self {
                insns: insns
                    .iter()
                    .map(|(vaddr, data)| MockInsn {
                        vaddr: *vaddr,
                        data: data.to_vec(),
                        hooks: Arc::new(Mutex::new(Vec::new())),
                    })
                    .collect(),
            }
        }

        fn hooks(&self, index: usize) -> Vec<(InsnHook, EventToken)> {
            self.insns[index].hooks.lock().unwrap().clone()
        }

        fn all_hooks(&self) -> Vec<(InsnHook, EventToken)> {
            self.insns
                .iter()
                .flat_map(|insn| insn.hooks.lock().unwrap().clone())
                .collect()
        }
    }

    impl TranslationBlock for MockBlock {
        type Insn = MockInsn;

        fn insn_count(&self) -> usize {
            self.insns.len()
        }

        fn insn(&self, index: usize) -> Option<MockInsn> {
            self.insns.get(index).cloned()
        }
    }

    fn sock_path(name: &str) -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "cannonball-tracer-{}-{}-{}.sock",
            name,
            std::process::id(),
            id
        ))
    }

    fn spawn_consumer(path: &PathBuf) -> thread::JoinHandle<Vec<EventRecord>> {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path).unwrap();
        thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = BytesMut::new();
            let mut chunk = [0u8; 4096];
            let mut events = Vec::new();
            loop {
                let n = conn.read(&mut chunk).unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                while let Some(record) = decode_record(&mut buf).unwrap() {
                    events.push(record);
                }
            }
            events
        })
    }

    /// Stand up a tracer wired to an in-test consumer.
    fn tracer_with(
        name: &str,
        trace_args: &[&str],
    ) -> (Tracer, thread::JoinHandle<Vec<EventRecord>>, PathBuf) {
        let path = sock_path(name);
        let consumer = spawn_consumer(&path);

        let mut args: Vec<String> = trace_args.iter().map(|arg| arg.to_string()).collect();
        args.push(format!("sock_path={}", path.display()));

        let info = HostInfo {
            system_emulation: false,
            max_vcpus: 4,
        };
        let tracer = Tracer::install(&info, FixedImage(TEST_IMAGE), &args).unwrap();
        (tracer, consumer, path)
    }

    fn finish(
        tracer: Tracer,
        consumer: thread::JoinHandle<Vec<EventRecord>>,
        path: PathBuf,
    ) -> Vec<EventRecord> {
        tracer.on_exit(0);
        let events = consumer.join().unwrap();
        let _ = std::fs::remove_file(&path);
        events
    }

    fn assert_load(record: &EventRecord) {
        assert_eq!(record.flags, EventFlags::LOAD);
        match record.kind {
            EventKind::Load(load) => {
                assert_eq!(load.min, TEST_IMAGE.start_code);
                assert_eq!(load.max, TEST_IMAGE.end_code);
                assert_eq!(load.entry, TEST_IMAGE.entry_code);
                assert_eq!(load.prot, 0x7);
            }
            _ => panic!("expected load payload"),
        }
    }

    #[test]
    fn pc_only_three_insn_block() {
        let (tracer, consumer, path) = tracer_with("pc-only", &["trace_pc=on"]);
        assert!(tracer.needs_translation_hook());
        assert!(!tracer.needs_syscall_hooks());

        let tb = MockBlock::new(&[(0x1000, &[0x90]), (0x1004, &[0x90]), (0x1008, &[0xc3])]);
        tracer.on_translation(&tb);

        // One execute hook per instruction, in order.
        for index in 0..3 {
            let hooks = tb.hooks(index);
            assert_eq!(hooks.len(), 1);
            assert_eq!(hooks[0].0, InsnHook::Exec);
            tracer.on_insn_exec(0, hooks[0].1);
        }

        let events = finish(tracer, consumer, path);
        assert_eq!(events.len(), 4);
        assert_load(&events[0]);

        let expected = [(0x1000, false), (0x1004, false), (0x1008, true)];
        for (record, (pc, branch)) in events[1..].iter().zip(expected) {
            assert_eq!(record.flags, EventFlags::PC);
            match record.kind {
                EventKind::Pc(event) => {
                    assert_eq!(event.pc, pc);
                    assert_eq!(event.branch, branch);
                }
                _ => panic!("expected pc payload"),
            }
        }
    }

    #[test]
    fn branch_only_instruments_last_insn() {
        let (tracer, consumer, path) = tracer_with("branch-only", &["trace_branches=on"]);

        let tb = MockBlock::new(&[(0x1000, &[0x90]), (0x1004, &[0x90]), (0x1008, &[0xc3])]);
        tracer.on_translation(&tb);

        // Only the block-terminating instruction gets a hook.
        assert!(tb.hooks(0).is_empty());
        assert!(tb.hooks(1).is_empty());
        let hooks = tb.hooks(2);
        assert_eq!(hooks.len(), 1);

        tracer.on_insn_exec(0, hooks[0].1);

        let events = finish(tracer, consumer, path);
        assert_eq!(events.len(), 2);
        assert_load(&events[0]);
        assert_eq!(events[1].flags, EventFlags::BRANCHES);
        match events[1].kind {
            EventKind::Pc(event) => {
                assert_eq!(event.pc, 0x1008);
                assert!(event.branch);
            }
            _ => panic!("expected pc payload"),
        }
    }

    #[test]
    fn instr_and_mem_single_insn_read() {
        let (tracer, consumer, path) = tracer_with(
            "instr-mem",
            &["trace_instrs=on", "trace_reads=on"],
        );

        let opcode: &[u8] = &[0x8b, 0x03];
        let tb = MockBlock::new(&[(0x1000, opcode)]);
        tracer.on_translation(&tb);

        let hooks = tb.hooks(0);
        let exec = hooks
            .iter()
            .find(|(hook, _)| *hook == InsnHook::Exec)
            .copied()
            .unwrap();
        let mem_exec = hooks
            .iter()
            .find(|(hook, _)| *hook == InsnHook::MemExec)
            .copied()
            .unwrap();
        let mem_access = hooks
            .iter()
            .find(|(hook, _)| *hook == InsnHook::MemAccess)
            .copied()
            .unwrap();
        // The memory hooks share one identity; the instr hook has its
        // own.
        assert_eq!(mem_exec.1, mem_access.1);
        assert_ne!(exec.1, mem_exec.1);

        // Execute callbacks fire first: the instr event goes out, the
        // memory event must stay parked until the access arrives.
        tracer.on_insn_exec(0, exec.1);
        tracer.on_mem_insn_exec(0, mem_exec.1);
        assert_eq!(tracer.sender().stats().submitted, 2); // load + instr

        tracer.on_mem_access(0, MemInfo::new(false), 0xdead_0000, mem_access.1);
        assert_eq!(tracer.sender().stats().submitted, 3);

        let events = finish(tracer, consumer, path);
        assert_eq!(events.len(), 3);
        assert_load(&events[0]);

        assert_eq!(events[1].flags, EventFlags::INSTRS);
        match events[1].kind {
            EventKind::Instr(event) => {
                assert_eq!(event.pc, 0x1000);
                assert_eq!(event.bytes(), opcode);
            }
            _ => panic!("expected instr payload"),
        }

        assert_eq!(events[2].flags, EventFlags::READS_WRITES);
        match events[2].kind {
            EventKind::MemAccess(event) => {
                assert_eq!(event.pc, 0x1000);
                assert_eq!(event.addr, 0xdead_0000);
                assert!(!event.is_write);
            }
            _ => panic!("expected mem access payload"),
        }
    }

    #[test]
    fn mem_access_before_exec() {
        let (tracer, consumer, path) = tracer_with("mem-first", &["trace_writes=on"]);

        let tb = MockBlock::new(&[(0x2000, &[0x89, 0x03])]);
        tracer.on_translation(&tb);
        let hooks = tb.all_hooks();
        let token = hooks[0].1;

        tracer.on_mem_access(0, MemInfo::new(true), 0xbeef_0000, token);
        assert_eq!(tracer.sender().stats().submitted, 1); // load only
        tracer.on_mem_insn_exec(0, token);

        let events = finish(tracer, consumer, path);
        assert_eq!(events.len(), 2);
        match events[1].kind {
            EventKind::MemAccess(event) => {
                assert_eq!(event.addr, 0xbeef_0000);
                assert!(event.is_write);
            }
            _ => panic!("expected mem access payload"),
        }
    }

    #[test]
    fn syscall_entry_and_return() {
        let (tracer, consumer, path) = tracer_with("syscall", &["trace_syscalls=on"]);
        assert!(!tracer.needs_translation_hook());
        assert!(tracer.needs_syscall_hooks());

        let args = [0, 0x1000, 10, 0, 0, 0, 0, 0];
        tracer.on_syscall(0, 1, args);
        tracer.on_syscall_ret(0, 1, 10);

        let events = finish(tracer, consumer, path);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].flags, EventFlags::SYSCALLS);
        match events[0].kind {
            EventKind::Syscall(event) => {
                assert_eq!(event.num, 1);
                assert_eq!(event.rv, 10);
                assert_eq!(event.args, args);
            }
            _ => panic!("expected syscall payload"),
        }
    }

    #[test]
    fn double_syscall_entry_drops_the_first() {
        let (tracer, consumer, path) = tracer_with("syscall-evict", &["trace_syscalls=on"]);

        tracer.on_syscall(0, 1, [1; 8]);
        tracer.on_syscall(0, 2, [2; 8]);
        tracer.on_syscall_ret(0, 2, 0);

        let events = finish(tracer, consumer, path);
        assert_eq!(events.len(), 1);
        match events[0].kind {
            EventKind::Syscall(event) => {
                assert_eq!(event.num, 2);
                assert_eq!(event.args, [2; 8]);
            }
            _ => panic!("expected syscall payload"),
        }
    }

    #[test]
    fn syscall_number_mismatch_drops_the_entry() {
        let (tracer, consumer, path) = tracer_with("syscall-mismatch", &["trace_syscalls=on"]);

        tracer.on_syscall(0, 3, [0; 8]);
        tracer.on_syscall_ret(0, 4, 0);
        // The stale entry is gone; a fresh pair still traces.
        tracer.on_syscall(0, 5, [5; 8]);
        tracer.on_syscall_ret(0, 5, -2);

        let events = finish(tracer, consumer, path);
        assert_eq!(events.len(), 1);
        match events[0].kind {
            EventKind::Syscall(event) => {
                assert_eq!(event.num, 5);
                assert_eq!(event.rv, -2);
            }
            _ => panic!("expected syscall payload"),
        }
    }

    #[test]
    fn stale_tokens_are_ignored() {
        let (tracer, consumer, path) = tracer_with("stale", &["trace_pc=on"]);

        let tb = MockBlock::new(&[(0x1000, &[0x90])]);
        tracer.on_translation(&tb);
        let token = tb.hooks(0)[0].1;

        // Re-execution of the same instruction races an earlier claim.
        tracer.on_insn_exec(0, token);
        tracer.on_insn_exec(0, token);
        tracer.on_insn_exec(1, EventToken::from_raw(0xffff_ffff));

        let events = finish(tracer, consumer, path);
        assert_eq!(events.len(), 2); // load + one pc
    }

    #[test]
    fn load_is_emitted_exactly_once_and_first() {
        let (tracer, consumer, path) = tracer_with("load-once", &["trace_pc=on"]);

        let first = MockBlock::new(&[(0x1000, &[0x90])]);
        let second = MockBlock::new(&[(0x2000, &[0x90])]);
        tracer.on_translation(&first);
        tracer.on_translation(&second);

        for (_, token) in first.all_hooks().into_iter().chain(second.all_hooks()) {
            tracer.on_insn_exec(0, token);
        }

        let events = finish(tracer, consumer, path);
        assert_eq!(events.len(), 3);
        assert_load(&events[0]);
        assert!(events[1..]
            .iter()
            .all(|record| matches!(record.kind, EventKind::Pc(_))));
    }

    #[test]
    fn submissions_per_insn_match_requested_classes() {
        let (tracer, consumer, path) = tracer_with(
            "popcount",
            &["trace_pc=on", "trace_instrs=on", "trace_reads=on"],
        );

        let tb = MockBlock::new(&[(0x1000, &[0x8b, 0x03])]);
        tracer.on_translation(&tb);

        for (hook, token) in tb.all_hooks() {
            match hook {
                InsnHook::Exec => tracer.on_insn_exec(0, token),
                InsnHook::MemExec => tracer.on_mem_insn_exec(0, token),
                InsnHook::MemAccess => {
                    tracer.on_mem_access(0, MemInfo::new(false), 0x3000, token)
                }
            }
        }

        let events = finish(tracer, consumer, path);
        // load + one submission per requested instruction class
        assert_eq!(events.len(), 1 + 3);
        // Every submitted record carries exactly the bits its callbacks
        // were contracted to set.
        for record in &events[1..] {
            assert!(EventFlags::ready(record.flags, record.flags));
            assert_eq!(record.flags.bits().count_ones(), 1);
        }
    }

    #[test]
    fn system_emulation_is_refused() {
        let info = HostInfo {
            system_emulation: true,
            max_vcpus: 1,
        };
        let result = Tracer::install(&info, FixedImage(TEST_IMAGE), &["trace_pc=on"]);
        assert!(matches!(result, Err(CoreError::SystemEmulationUnsupported)));
    }
}
