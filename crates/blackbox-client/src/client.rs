use std::{
    fmt::{self, Write as _},
    fs::File,
    io::Write as _,
    net::{Ipv4Addr, SocketAddr},
    path::Path,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU8, Ordering},
    },
};

use blackbox_net::{
    Connection,
    discovery::{DiscoveryParams, client_start},
};
use blackbox_protocol::{
    APPLICATION_NAME_SIZE, AppInfo, CATEGORY_SIZE, Color, Colors, FrameEnd, FrameNumber,
    InitFlags, LOG_TEXT_SIZE, LogLevel, LogText, MAX_PACKET_BUFFER_SIZE, MAX_PATH_SIZE, Packet,
    PacketHeader, PacketKind, Platform, RegisterId, Text, encode_frame,
};
use blackbox_timing::{Duration, Instant, Ticks, micros_from_epoch, millis_per_tick};
use tracing::{error, warn};

use crate::{
    ids::IdState,
    spill::SpillBuffer,
    trace::{
        ThreadTrace, drop_thread_trace, floor_char_boundary, resolve_colors, with_thread_trace,
    },
};

/// Largest text payload per frame; longer texts ride `LogTextPartial` chains.
const MAX_TEXT_CHUNK: usize = LOG_TEXT_SIZE - 1;
const FILE_FLUSH_INTERVAL: Duration = Duration::from_millis(500);
const TRACE_TRUNCATE: usize = crate::trace::TRACE_SCRATCH_SIZE;

const STATE_UNINIT: u8 = 0;
const STATE_READY: u8 = 1;
const STATE_SHUTDOWN: u8 = 2;

pub type SendCallback = Arc<dyn Fn(&Packet) + Send + Sync>;
pub type WriteCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;
pub type FlushCallback = Arc<dyn Fn() + Send + Sync>;
pub type IncomingPacketHandler = Arc<dyn Fn(&Packet) + Send + Sync>;

#[derive(Clone, Debug, Default)]
pub struct InitConfig {
    pub application_name: String,
    pub source_application_name: String,
    pub device_code: String,
    pub source_ip: u32,
    pub flags: InitFlags,
}

impl InitConfig {
    pub fn new<S: Into<String>>(application_name: S) -> Self {
        Self { application_name: application_name.into(), ..Self::default() }
    }

    pub fn with_flags(mut self, flags: InitFlags) -> Self {
        self.flags = flags;
        self
    }
}

#[derive(Default)]
struct Meta {
    application_name: String,
    application_group: String,
    source_application_name: String,
    device_code: String,
    source_ip: u32,
    flags: InitFlags,
    server_addr: Option<SocketAddr>,
}

struct Sinks {
    file: Option<File>,
    last_file_flush: Instant,
    send_callback: Option<SendCallback>,
    write_callback: Option<WriteCallback>,
    flush_callback: Option<FlushCallback>,
    incoming_handler: Option<IncomingPacketHandler>,
}

impl Default for Sinks {
    fn default() -> Self {
        Self {
            file: None,
            last_file_flush: Instant::ZERO,
            send_callback: None,
            write_callback: None,
            flush_callback: None,
            incoming_handler: None,
        }
    }
}

/// The capture runtime: one connection, one id table, one app-info snapshot.
///
/// Lock order, where multiple are held: ids, meta, spill, sinks, then the
/// connection's internal lock.
pub struct Client {
    state: AtomicU8,
    con: Connection,
    ids: Mutex<IdState>,
    meta: Mutex<Meta>,
    spill: Mutex<SpillBuffer>,
    sinks: Mutex<Sinks>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(target_os = "linux")]
pub fn current_thread_id() -> u64 {
    (unsafe { libc::syscall(libc::SYS_gettid) }) as u64
}

#[cfg(not(target_os = "linux"))]
pub fn current_thread_id() -> u64 {
    use std::sync::atomic::AtomicU64;
    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static ID: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    ID.with(|id| *id)
}

fn truncated(s: &str, capacity: usize) -> String {
    if s.len() < capacity {
        s.to_string()
    } else {
        s[..floor_char_boundary(s, capacity - 1)].to_string()
    }
}

impl Client {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_UNINIT),
            con: Connection::new(),
            ids: Mutex::new(IdState::new()),
            meta: Mutex::new(Meta::default()),
            spill: Mutex::new(SpillBuffer::default()),
            sinks: Mutex::new(Sinks::default()),
        }
    }

    #[inline]
    fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    #[inline]
    fn is_shut_down(&self) -> bool {
        self.state() == STATE_SHUTDOWN
    }

    fn fill_header(&self, file_id: u32, line: u32) -> PacketHeader {
        PacketHeader {
            timestamp: Ticks::now().0,
            thread_id: current_thread_id(),
            file_id,
            line,
        }
    }

    // ---- lifecycle -------------------------------------------------------

    /// Designates the pre-connection spill capacity. Only before `init`.
    pub fn set_initial_buffer(&self, capacity: usize) {
        if self.state() != STATE_UNINIT {
            error!("initial buffer can only be set before init");
            return;
        }
        lock(&self.spill).set_capacity(capacity);
    }

    /// Only before `init`.
    pub fn set_application_group(&self, group: &str) {
        if self.state() != STATE_UNINIT {
            error!("application group can only be set before init");
            return;
        }
        lock(&self.meta).application_group = truncated(group, APPLICATION_NAME_SIZE);
    }

    pub fn set_store_thread_packets(&self, store: bool) {
        lock(&self.ids).store_thread_packets = store;
    }

    /// Captures app info and, unless told otherwise, locates a server and
    /// connects. At most one `init` per process; repeats are no-ops.
    pub fn init(&self, config: InitConfig) {
        if self
            .state
            .compare_exchange(STATE_UNINIT, STATE_READY, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let flags = config.flags;
        {
            let mut meta = lock(&self.meta);
            meta.application_name = truncated(&config.application_name, APPLICATION_NAME_SIZE);
            meta.source_application_name =
                truncated(&config.source_application_name, APPLICATION_NAME_SIZE);
            meta.device_code = truncated(&config.device_code, APPLICATION_NAME_SIZE);
            meta.source_ip = config.source_ip;
            meta.flags = flags;
        }
        {
            let mut ids = lock(&self.ids);
            ids.initial_app_info = Some(self.build_app_info());
            let has_file = lock(&self.sinks).file.is_some();
            if has_file && !ids.file_sent_app_info {
                self.send_initial_locked(&mut ids, false, false, true);
                ids.file_sent_app_info = true;
            }
        }

        if flags.contains(InitFlags::NO_CONNECT) {
            return;
        }
        if flags.contains(InitFlags::NO_DISCOVERY) {
            // no discovery, so only try the local server
            self.connect(Some(Ipv4Addr::LOCALHOST), 0);
        } else {
            self.connect(None, 0);
        }
    }

    /// Emits `ThreadEnd` for the calling thread, then closes every sink.
    /// Always safe to call; afterwards the whole API is a no-op.
    pub fn shutdown(&self, file: &str, line: u32) {
        if self.is_shut_down() {
            return;
        }
        let path_id = self.resolve_path_id(file, line);
        self.thread_end(path_id, line);
        {
            let mut sinks = lock(&self.sinks);
            if let Some(mut file) = sinks.file.take() {
                let _ = file.flush();
            }
        }
        self.con.flush();
        self.con.reset();
        self.state.store(STATE_SHUTDOWN, Ordering::Release);
    }

    /// Opens (or replaces nothing if already open) the file mirror. If app
    /// info was already captured the mirror starts with the full replay.
    pub fn init_file<P: AsRef<Path>>(&self, path: P) {
        {
            let mut sinks = lock(&self.sinks);
            if sinks.file.is_some() {
                return;
            }
            match File::create(path.as_ref()) {
                Ok(file) => sinks.file = Some(file),
                Err(err) => {
                    error!(?err, path = %path.as_ref().display(), "couldn't open mirror file");
                    return;
                }
            }
        }
        let mut ids = lock(&self.ids);
        if ids.initial_app_info.is_some() && !ids.file_sent_app_info {
            self.send_initial_locked(&mut ids, false, false, true);
            ids.file_sent_app_info = true;
        }
    }

    // ---- connection ------------------------------------------------------

    /// Discovers a server (targeted or broadcast) and connects. A failed
    /// targeted discovery falls back to broadcast once.
    pub fn connect(&self, discovery_addr: Option<Ipv4Addr>, discovery_port: u16) {
        if self.state() != STATE_READY {
            return;
        }
        if self.connect_via_discovery(discovery_addr, discovery_port) {
            return;
        }
        if discovery_addr.is_some() {
            self.connect_via_discovery(None, discovery_port);
        }
    }

    fn connect_via_discovery(&self, addr: Option<Ipv4Addr>, port: u16) -> bool {
        let mut ids = lock(&self.ids);
        let callbacks = !ids.callback_sent_app_info;
        ids.callback_sent_app_info = true;
        let file = !ids.file_sent_app_info;
        ids.file_sent_app_info = true;

        self.con.disconnect();
        let params = {
            let meta = lock(&self.meta);
            DiscoveryParams {
                application_name: meta.application_name.clone(),
                source_application_name: meta.source_application_name.clone(),
                device_code: meta.device_code.clone(),
                source_ip: meta.source_ip,
                search_addr: addr,
                search_port: port,
            }
        };

        let mut socket = false;
        if let Some(endpoint) = client_start(&params) {
            let server = SocketAddr::from((endpoint.addr, endpoint.port));
            lock(&self.meta).server_addr = Some(server);
            if self.con.connect_async(server) {
                while self.con.is_connecting() {
                    self.con.tick_connecting();
                }
                socket = self.con.is_connected();
            }
        }

        self.send_initial_locked(&mut ids, callbacks, socket, file);
        socket
    }

    /// Discovery against a textual address. Returns false when the address
    /// does not parse; discovery speaks v4 here.
    pub fn connect_str(&self, discovery_addr: &str, discovery_port: u16) -> bool {
        match discovery_addr.parse::<Ipv4Addr>() {
            Ok(addr) => {
                self.connect(Some(addr), discovery_port);
                true
            }
            Err(err) => {
                error!(?err, discovery_addr, "unusable discovery address");
                false
            }
        }
    }

    /// Connects straight to a known endpoint, skipping discovery. An
    /// optional payload goes out first, before the replay.
    pub fn connect_direct(&self, addr: SocketAddr, payload: Option<&[u8]>) {
        if self.state() != STATE_READY {
            return;
        }
        let mut ids = lock(&self.ids);
        let callbacks = !ids.callback_sent_app_info;
        ids.callback_sent_app_info = true;
        let file = !ids.file_sent_app_info;
        ids.file_sent_app_info = true;

        self.con.disconnect();
        lock(&self.meta).server_addr = Some(addr);

        let mut socket = false;
        if self.con.connect_async(addr) {
            while self.con.is_connecting() {
                self.con.tick_connecting();
            }
            if self.con.is_connected() {
                socket = true;
                if let Some(payload) = payload {
                    self.con.send_raw(payload);
                }
            }
        }
        self.send_initial_locked(&mut ids, callbacks, socket, file);
    }

    /// Flushes and closes; further logs go to the file and callbacks only.
    pub fn disconnect(&self) {
        if self.con.is_connected() {
            self.con.disconnect();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.con.is_connected()
    }

    pub fn server_addr(&self) -> Option<SocketAddr> {
        lock(&self.meta).server_addr
    }

    pub fn total_bytes_sent(&self) -> u64 {
        self.con.sent_bytes_total()
    }

    pub fn total_bytes_received(&self) -> u64 {
        self.con.received_bytes_total()
    }

    pub fn set_send_interval(&self, interval: Duration) {
        self.con.set_send_interval(interval);
    }

    /// Drains server-to-client packets into the registered handler and keeps
    /// the flush cadences honest.
    pub fn tick(&self) {
        if self.is_shut_down() {
            return;
        }
        self.con.tick();

        let flush_callback = {
            let mut sinks = lock(&self.sinks);
            if (sinks.file.is_some() || sinks.flush_callback.is_some())
                && sinks.last_file_flush.elapsed() >= FILE_FLUSH_INTERVAL
            {
                sinks.last_file_flush = Instant::now();
                if let Some(file) = sinks.file.as_mut() {
                    let _ = file.flush();
                }
                sinks.flush_callback.clone()
            } else {
                None
            }
        };
        if let Some(callback) = flush_callback {
            callback();
        }

        loop {
            match self.con.decode_packet() {
                Ok(Some(packet)) => {
                    let handler = lock(&self.sinks).incoming_handler.clone();
                    if let Some(handler) = handler {
                        handler(&packet);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    // the length prefix is the only framing signal, so a bad
                    // frame means the rest of the stream is unreadable
                    error!(?err, "malformed incoming frame, dropping connection");
                    self.con.disconnect_no_flush();
                    break;
                }
            }
        }
    }

    /// Synchronously flushes socket, file, and callback sinks.
    pub fn flush(&self) {
        let flush_callback = lock(&self.sinks).flush_callback.clone();
        if let Some(callback) = flush_callback {
            callback();
        }
        {
            let mut sinks = lock(&self.sinks);
            if let Some(file) = sinks.file.as_mut() {
                let _ = file.flush();
            }
        }
        self.con.flush();
    }

    // ---- callbacks -------------------------------------------------------

    pub fn set_send_callback(&self, callback: impl Fn(&Packet) + Send + Sync + 'static) {
        lock(&self.sinks).send_callback = Some(Arc::new(callback));
    }

    pub fn set_write_callback(&self, callback: impl Fn(&[u8]) + Send + Sync + 'static) {
        lock(&self.sinks).write_callback = Some(Arc::new(callback));
    }

    pub fn set_flush_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        lock(&self.sinks).flush_callback = Some(Arc::new(callback));
    }

    pub fn set_incoming_packet_handler(
        &self,
        handler: impl Fn(&Packet) + Send + Sync + 'static,
    ) {
        lock(&self.sinks).incoming_handler = Some(Arc::new(handler));
    }

    // ---- thread identity -------------------------------------------------

    pub fn thread_start(&self, path_id: u32, line: u32, name: &str) {
        if self.is_shut_down() {
            return;
        }
        let header = self.fill_header(path_id, line);
        let packet =
            Packet::new(header, PacketKind::ThreadStart(Text::new(truncated(name, LOG_TEXT_SIZE))));
        self.store_thread_packet(&packet);
        self.send_packet(&packet);
    }

    pub fn thread_set_name(&self, path_id: u32, line: u32, name: &str) {
        if self.is_shut_down() {
            return;
        }
        let header = self.fill_header(path_id, line);
        let packet =
            Packet::new(header, PacketKind::ThreadName(Text::new(truncated(name, LOG_TEXT_SIZE))));
        self.store_thread_packet(&packet);
        self.send_packet(&packet);
    }

    /// Ends the calling thread's identity and frees its scratch state.
    pub fn thread_end(&self, path_id: u32, line: u32) {
        if self.is_shut_down() {
            return;
        }
        self.trace_partial_end();
        let header = self.fill_header(path_id, line);
        let packet = Packet::new(header, PacketKind::ThreadEnd);
        self.store_thread_packet(&packet);
        self.send_packet(&packet);
        drop_thread_trace();
    }

    fn store_thread_packet(&self, packet: &Packet) {
        let mut ids = lock(&self.ids);
        if ids.store_thread_packets {
            ids.thread_packets.push(packet.clone());
        }
    }

    // ---- interned ids ----------------------------------------------------

    /// Resolves a `(path, category)` pair, emitting registrations for
    /// whichever halves are new. Registration and id allocation share one
    /// critical section so a registration always precedes its first use.
    pub fn resolve_ids(&self, path: &str, category: &str, line: u32) -> (u32, u32) {
        if self.is_shut_down() {
            return (0, 0);
        }
        let mut ids = lock(&self.ids);
        let path_id = self.resolve_path_locked(&mut ids, path, line);
        let category_id = self.resolve_category_locked(&mut ids, category, path_id, line, true);
        (path_id, category_id)
    }

    pub fn resolve_path_id(&self, path: &str, line: u32) -> u32 {
        if self.is_shut_down() {
            return 0;
        }
        let mut ids = lock(&self.ids);
        self.resolve_path_locked(&mut ids, path, line)
    }

    fn resolve_path_locked(&self, ids: &mut IdState, path: &str, line: u32) -> u32 {
        if let Some(id) = ids.path_ids.find(path) {
            return id;
        }
        let next = ids.path_ids.peek_next_id();
        let header = self.fill_header(next, line);
        let id = ids.path_ids.insert(path, header);
        self.send_packet(&Packet::new(
            header,
            PacketKind::FileId(RegisterId { id, name: truncated(path, MAX_PATH_SIZE) }),
        ));
        id
    }

    fn resolve_category_locked(
        &self,
        ids: &mut IdState,
        category: &str,
        path_id: u32,
        line: u32,
        recurse: bool,
    ) -> u32 {
        if let Some(id) = ids.category_ids.find(category) {
            return id;
        }
        if recurse {
            // parents of a::b::c get their own ids first
            for (pos, _) in category.match_indices("::") {
                let parent = &category[..pos];
                if !parent.is_empty() {
                    self.resolve_category_locked(ids, parent, path_id, line, false);
                }
            }
        }
        let next = ids.category_ids.peek_next_id();
        let header = self.fill_header(if path_id != 0 { path_id } else { next }, line);
        let id = ids.category_ids.insert(category, header);
        self.send_packet(&Packet::new(
            header,
            PacketKind::CategoryId(RegisterId { id, name: truncated(category, CATEGORY_SIZE) }),
        ));
        id
    }

    // ---- log emission ----------------------------------------------------

    /// Formatted log with pre-resolved ids. Appends a trailing newline when
    /// the text lacks one.
    pub fn trace(
        &self,
        path_id: u32,
        line: u32,
        category_id: u32,
        level: LogLevel,
        pie_instance: i32,
        args: fmt::Arguments,
    ) {
        if self.is_shut_down() {
            return;
        }
        self.trace_partial_end();
        with_thread_trace(|t| {
            t.scratch.clear();
            let _ = write!(t.scratch, "{args}");
            if t.scratch.len() > TRACE_TRUNCATE {
                let cut = floor_char_boundary(&t.scratch, TRACE_TRUNCATE);
                t.scratch.truncate(cut);
            }
            if !t.scratch.ends_with('\n') {
                t.scratch.push('\n');
            }
            if level == LogLevel::SetColor {
                t.colors = resolve_colors(&t.scratch);
                return;
            }
            let colors = t.colors;
            self.emit_log_text(
                path_id,
                line,
                category_id,
                level as u32,
                pie_instance,
                colors,
                &t.scratch,
            );
        });
    }

    /// Formatted log resolving ids on the way.
    pub fn trace_dynamic(
        &self,
        path: &str,
        line: u32,
        category: &str,
        level: LogLevel,
        pie_instance: i32,
        args: fmt::Arguments,
    ) {
        if self.is_shut_down() {
            return;
        }
        let (path_id, category_id) = self.resolve_ids(path, category, line);
        self.trace(path_id, line, category_id, level, pie_instance, args);
    }

    /// Verbatim log text: no formatting, no appended newline.
    pub fn trace_preformatted(
        &self,
        path: &str,
        line: u32,
        category: &str,
        level: LogLevel,
        pie_instance: i32,
        text: &str,
    ) {
        if self.is_shut_down() {
            return;
        }
        let (path_id, category_id) = self.resolve_ids(path, category, line);
        if level == LogLevel::SetColor {
            self.trace_partial_end();
            with_thread_trace(|t| t.colors = resolve_colors(text));
            return;
        }
        let colors = with_thread_trace(|t| t.colors);
        self.emit_log_text(path_id, line, category_id, level as u32, pie_instance, colors, text);
    }

    fn emit_log_text(
        &self,
        path_id: u32,
        line: u32,
        category_id: u32,
        level: u32,
        pie_instance: i32,
        colors: Colors,
        text: &str,
    ) {
        let header = self.fill_header(path_id, line);
        let log = |text: String| LogText { category_id, level, pie_instance, colors, text };

        if text.len() <= MAX_TEXT_CHUNK {
            self.send_packet(&Packet::new(header, PacketKind::LogText(log(text.to_string()))));
            return;
        }

        let mut packets = Vec::new();
        let mut rest = text;
        while rest.len() > MAX_TEXT_CHUNK {
            let cut = floor_char_boundary(rest, MAX_TEXT_CHUNK);
            packets.push(Packet::new(header, PacketKind::LogTextPartial(log(rest[..cut].to_string()))));
            rest = &rest[cut..];
        }
        packets.push(Packet::new(header, PacketKind::LogText(log(rest.to_string()))));
        self.send_log_fragments(&packets);
    }

    // ---- partial logs ----------------------------------------------------

    /// Accumulates partial text; chunks leave the thread as
    /// `LogTextPartial` frames as they fill.
    pub fn trace_partial(
        &self,
        path: &str,
        line: u32,
        category: &str,
        level: LogLevel,
        pie_instance: i32,
        args: fmt::Arguments,
    ) {
        if self.is_shut_down() {
            return;
        }
        let (path_id, category_id) = self.resolve_ids(path, category, line);
        let mut text = String::new();
        let _ = write!(text, "{args}");
        if text.len() > MAX_TEXT_CHUNK {
            text.truncate(floor_char_boundary(&text, MAX_TEXT_CHUNK));
        }
        self.trace_partial_append(path_id, line, category_id, level, pie_instance, &text);
    }

    fn trace_partial_append(
        &self,
        path_id: u32,
        line: u32,
        category_id: u32,
        level: LogLevel,
        pie_instance: i32,
        text: &str,
    ) {
        with_thread_trace(|t| {
            if t.partial.in_progress()
                && (t.partial.level != level as u32
                    || t.partial.category_id != category_id
                    || t.partial.pie_instance != pie_instance)
            {
                self.finish_partial(t);
            }
            t.partial.path_id = path_id;
            t.partial.line = line;
            t.partial.level = level as u32;
            t.partial.category_id = category_id;
            t.partial.pie_instance = pie_instance;

            let mut rest = text;
            while !rest.is_empty() {
                let space = MAX_TEXT_CHUNK - t.partial.text.len();
                let take =
                    if rest.len() <= space { rest.len() } else { floor_char_boundary(rest, space) };
                if take == 0 {
                    self.emit_partial_chunk(t);
                    continue;
                }
                t.partial.text.push_str(&rest[..take]);
                rest = &rest[take..];
                if t.partial.text.len() >= MAX_TEXT_CHUNK {
                    self.emit_partial_chunk(t);
                }
            }
            if !text.is_empty() {
                self.emit_partial_chunk(t);
            }
        });
    }

    /// Closes the current partial chain with its final `LogText`.
    pub fn trace_partial_end(&self) {
        if self.is_shut_down() {
            return;
        }
        with_thread_trace(|t| self.finish_partial(t));
    }

    fn emit_partial_chunk(&self, t: &mut ThreadTrace) {
        if t.partial.text.is_empty() {
            return;
        }
        if t.partial.level == LogLevel::SetColor as u32 {
            self.finish_partial(t);
            return;
        }
        let header = self.fill_header(t.partial.path_id, t.partial.line);
        let packet = Packet::new(
            header,
            PacketKind::LogTextPartial(LogText {
                category_id: t.partial.category_id,
                level: t.partial.level,
                pie_instance: t.partial.pie_instance,
                colors: t.colors,
                text: std::mem::take(&mut t.partial.text),
            }),
        );
        t.partial.packets_sent += 1;
        self.send_packet(&packet);
    }

    fn finish_partial(&self, t: &mut ThreadTrace) {
        if !t.partial.in_progress() {
            return;
        }
        let text = std::mem::take(&mut t.partial.text);
        t.partial.packets_sent = 0;
        if t.partial.level == LogLevel::SetColor as u32 {
            t.colors = resolve_colors(&text);
            return;
        }
        let header = self.fill_header(t.partial.path_id, t.partial.line);
        let packet = Packet::new(
            header,
            PacketKind::LogText(LogText {
                category_id: t.partial.category_id,
                level: t.partial.level,
                pie_instance: t.partial.pie_instance,
                colors: t.colors,
                text,
            }),
        );
        self.send_packet(&packet);
    }

    /// Updates the calling thread's colors for subsequent logs.
    pub fn set_color(&self, fg: Color, bg: Color) {
        self.trace_partial_end();
        with_thread_trace(|t| t.colors = Colors { fg, bg });
    }

    // ---- frame markers ---------------------------------------------------

    pub fn frame_end(&self, milliseconds: f64) {
        if self.is_shut_down() {
            return;
        }
        let header = self.fill_header(0, 0);
        self.send_packet(&Packet::new(header, PacketKind::FrameEnd(FrameEnd { milliseconds })));
    }

    pub fn frame_number(&self, frame_number: u64) {
        if self.is_shut_down() {
            return;
        }
        let header = self.fill_header(0, 0);
        self.send_packet(&Packet::new(
            header,
            PacketKind::FrameNumber(FrameNumber { frame_number }),
        ));
    }

    /// Embedder-built packets; only the console-autocomplete replies and the
    /// opaque user channel are accepted.
    pub fn send_raw_packet(&self, mut packet: Packet) -> bool {
        if self.is_shut_down() {
            return false;
        }
        match packet.kind {
            PacketKind::ConsoleAutocompleteResponseHeader(_)
            | PacketKind::ConsoleAutocompleteResponseEntry(_)
            | PacketKind::UserToServer(_) => {
                packet.header = self.fill_header(0, 0);
                self.send_packet(&packet);
                true
            }
            _ => false,
        }
    }

    // ---- delivery --------------------------------------------------------

    fn build_app_info(&self) -> Packet {
        let meta = lock(&self.meta);
        let header = self.fill_header(0, 0);
        Packet::new(
            header,
            PacketKind::AppInfo(AppInfo {
                initial_timestamp: header.timestamp,
                millis_per_tick: millis_per_tick(),
                application_name: meta.application_name.clone(),
                application_group: meta.application_group.clone(),
                init_flags: meta.flags.bits(),
                platform: Platform::current() as u32,
                micros_from_epoch: micros_from_epoch(),
            }),
        )
    }

    /// Full fan-out for one packet: spill, callbacks, file mirror, socket.
    fn send_packet(&self, packet: &Packet) {
        let mut buf = [0u8; MAX_PACKET_BUFFER_SIZE];
        let frame_len = match encode_frame(packet, &mut buf) {
            Ok(len) => len,
            Err(err) => {
                error!(?err, "failed to encode packet");
                return;
            }
        };
        let frame = &buf[..frame_len];

        if packet.kind.is_log_text() && !self.con.is_connected() {
            lock(&self.spill).record(frame);
        }
        let (send_callback, write_callback) = {
            let sinks = lock(&self.sinks);
            (sinks.send_callback.clone(), sinks.write_callback.clone())
        };
        if let Some(callback) = send_callback {
            callback(packet);
        }
        if let Some(callback) = write_callback {
            callback(frame);
        }
        {
            let mut sinks = lock(&self.sinks);
            if let Some(file) = sinks.file.as_mut() {
                if let Err(err) = file.write_all(frame) {
                    warn!(?err, "mirror file write failed");
                }
            }
        }
        self.con.send_raw(frame);
    }

    /// One oversized log's fragment chain. The socket and file see the whole
    /// chain as a single write so no other thread's frames can interleave.
    fn send_log_fragments(&self, packets: &[Packet]) {
        let mut all = Vec::with_capacity(packets.len() * (MAX_TEXT_CHUNK + 64));
        let mut spans = Vec::with_capacity(packets.len());
        for packet in packets {
            let mut buf = [0u8; MAX_PACKET_BUFFER_SIZE];
            match encode_frame(packet, &mut buf) {
                Ok(len) => {
                    spans.push((all.len(), len));
                    all.extend_from_slice(&buf[..len]);
                }
                Err(err) => error!(?err, "failed to encode log fragment"),
            }
        }
        if all.is_empty() {
            return;
        }

        if !self.con.is_connected() {
            lock(&self.spill).record(&all);
        }
        let (send_callback, write_callback) = {
            let sinks = lock(&self.sinks);
            (sinks.send_callback.clone(), sinks.write_callback.clone())
        };
        if let Some(callback) = send_callback {
            for packet in packets {
                callback(packet);
            }
        }
        if let Some(callback) = write_callback {
            for (start, len) in &spans {
                callback(&all[*start..*start + *len]);
            }
        }
        {
            let mut sinks = lock(&self.sinks);
            if let Some(file) = sinks.file.as_mut() {
                if let Err(err) = file.write_all(&all) {
                    warn!(?err, "mirror file write failed");
                }
            }
        }
        self.con.send_raw(&all);
    }

    /// Packet delivery with explicit sink selection, used by the replay.
    fn send_directed(&self, packet: &Packet, callbacks: bool, socket: bool, file: bool) {
        let mut buf = [0u8; MAX_PACKET_BUFFER_SIZE];
        let frame_len = match encode_frame(packet, &mut buf) {
            Ok(len) => len,
            Err(err) => {
                error!(?err, "failed to encode packet");
                return;
            }
        };
        let frame = &buf[..frame_len];

        if callbacks {
            let (send_callback, write_callback) = {
                let sinks = lock(&self.sinks);
                (sinks.send_callback.clone(), sinks.write_callback.clone())
            };
            if let Some(callback) = send_callback {
                callback(packet);
            }
            if let Some(callback) = write_callback {
                callback(frame);
            }
        }
        if file {
            let mut sinks = lock(&self.sinks);
            if let Some(file) = sinks.file.as_mut() {
                if let Err(err) = file.write_all(frame) {
                    warn!(?err, "mirror file write failed");
                }
            }
        }
        if socket {
            self.con.send_raw(frame);
        }
    }

    /// Replays, in order: app info, file ids, category ids, thread packets,
    /// then the raw spill bytes. Runs under the id lock so no fresh log can
    /// interleave with the replay.
    fn send_initial_locked(&self, ids: &mut IdState, callbacks: bool, socket: bool, file: bool) {
        let Some(app_info) = ids.initial_app_info.clone() else {
            return;
        };
        self.send_directed(&app_info, callbacks, socket, file);

        for record in &ids.path_ids.records {
            let packet = Packet::new(
                record.header,
                PacketKind::FileId(RegisterId {
                    id: record.id,
                    name: truncated(&record.name, MAX_PATH_SIZE),
                }),
            );
            self.send_directed(&packet, callbacks, socket, file);
        }
        for record in &ids.category_ids.records {
            let packet = Packet::new(
                record.header,
                PacketKind::CategoryId(RegisterId {
                    id: record.id,
                    name: truncated(&record.name, CATEGORY_SIZE),
                }),
            );
            self.send_directed(&packet, callbacks, socket, file);
        }
        for packet in &ids.thread_packets {
            self.send_directed(packet, callbacks, socket, file);
        }

        if socket {
            let spill = lock(&self.spill);
            if !spill.contents().is_empty() {
                self.con.send_raw(spill.contents());
            }
        }
    }
}

/// Writes log text to stdout or stderr by level; install as a send callback
/// to tee logs locally.
pub fn echo_to_stdout(packet: &Packet) {
    if let PacketKind::LogText(text) | PacketKind::LogTextPartial(text) = &packet.kind {
        match LogLevel::from_u32(text.level) {
            Some(LogLevel::Warning | LogLevel::Error | LogLevel::Fatal) => {
                eprint!("{}", text.text);
            }
            _ => print!("{}", text.text),
        }
    }
}
