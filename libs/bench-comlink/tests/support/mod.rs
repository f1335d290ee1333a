//! Simulated instruments served on 127.0.0.1

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bench_comlink::codec::load_frame::{self, cid, EOI, ROI, SOI};
use bench_comlink::codec::vdc_frame::{self, FC_READ_HOLDING, FC_WRITE_MULTIPLE};
use bench_comlink::config::{TcpConfig, TransportConfig};
use bench_comlink::models::load::STATUS_INFO_LEN;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub fn tcp_transport(addr: SocketAddr) -> TransportConfig {
    TransportConfig::Tcp(TcpConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        connect_timeout_ms: 1000,
        receive_timeout_ms: 300,
        settle_ms: 20,
    })
}

/// Background accept loop, stopped on drop
pub struct Served {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl Served {
    /// Close the listener and every open connection
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.task.abort();
    }
}

impl Drop for Served {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn serve<F, Fut>(handler: F) -> Served
where
    F: Fn(TcpStream) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let task = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let token = token.clone();
            let connection = handler(stream);
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {},
                    _ = connection => {},
                }
            });
        }
    });
    Served {
        addr,
        shutdown,
        task,
    }
}

// ============================================================================
// Silent device
// ============================================================================

/// Accepts connections and never answers
pub async fn silent_device() -> Served {
    serve(|mut stream| async move {
        let mut buf = [0u8; 256];
        while let Ok(n) = stream.read(&mut buf).await {
            if n == 0 {
                break;
            }
        }
    })
    .await
}

// ============================================================================
// Electronic load
// ============================================================================

#[derive(Debug, Clone)]
pub struct LoadState {
    pub address: u8,
    pub version: Vec<u8>,
    pub configs: [[u8; 6]; 8],
    pub status: Vec<u8>,
    pub output_voltage_raw: Option<u16>,
    /// (addr, cid, info) of every request seen
    pub requests: Vec<(u8, u8, Vec<u8>)>,
}

impl Default for LoadState {
    fn default() -> Self {
        let mut status = vec![0u8; STATUS_INFO_LEN];
        for channel in 0..8 {
            let record = &mut status[channel * 8..channel * 8 + 8];
            // 400 V, 2.5 A, 380 V secondary, online
            record.copy_from_slice(&[0x1F, 0x40, 0x00, 0xFA, 0x1D, 0xB0, 0x00, 0x01]);
        }
        // both voltage levels normal, no fault bits
        status[64] = 0b0100_0100;
        Self {
            address: 1,
            version: b"V1.10".to_vec(),
            configs: [[0x00, 0x1F, 0x40, 0x00, 0x64, 0x00]; 8],
            status,
            output_voltage_raw: None,
            requests: Vec::new(),
        }
    }
}

pub struct FakeLoad {
    pub served: Served,
    pub state: Arc<Mutex<LoadState>>,
}

impl FakeLoad {
    pub fn addr(&self) -> SocketAddr {
        self.served.addr
    }

    pub fn transport(&self) -> TransportConfig {
        tcp_transport(self.served.addr)
    }
}

fn unescape(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut bytes = body.iter();
    while let Some(&byte) = bytes.next() {
        if byte == ROI {
            if let Some(&escaped) = bytes.next() {
                out.push(escaped);
            }
        } else {
            out.push(byte);
        }
    }
    out
}

/// Split one escaped frame off the front of `buf`
fn take_load_frame(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    let start = buf.iter().position(|&b| b == SOI)?;
    let mut i = start + 1;
    while i < buf.len() {
        match buf[i] {
            ROI => i += 2,
            EOI => {
                let frame = buf[start..=i].to_vec();
                buf.drain(..=i);
                return Some(frame);
            },
            _ => i += 1,
        }
    }
    None
}

fn load_reply(state: &mut LoadState, frame: &[u8]) -> Option<Vec<u8>> {
    let body = unescape(&frame[1..frame.len() - 1]);
    let (addr, command) = (body[0], body[1]);
    let info = load_frame::decode(frame).ok()?;
    state.requests.push((addr, command, info.clone()));

    if addr != state.address && addr != load_frame::BROADCAST_ADDR {
        return None;
    }
    let reply_info = match command {
        cid::READ_VERSION => state.version.clone(),
        cid::READ_STATUS => state.status.clone(),
        cid::READ_ALL_CONFIGS => state.configs.concat(),
        cid::SET_OUTPUT_VOLTAGE => {
            state.output_voltage_raw = Some(u16::from_be_bytes([info[0], info[1]]));
            Vec::new()
        },
        cid::SET_CHANNEL | cid::SET_CHANNEL_PERSIST => {
            let index = usize::from(info[0]) - 1;
            state.configs[index].copy_from_slice(&info[1..7]);
            Vec::new()
        },
        cid::SET_ALL_CHANNELS | cid::SET_ALL_CHANNELS_PERSIST => {
            for (slot, record) in state.configs.iter_mut().zip(info.chunks_exact(6)) {
                slot.copy_from_slice(record);
            }
            Vec::new()
        },
        _ => return load_frame::encode(addr, 0xF2, &[]).ok(),
    };
    if !load_frame::expects_reply(addr, command) {
        return None;
    }
    load_frame::encode(state.address, 0x00, &reply_info).ok()
}

pub async fn fake_load(state: LoadState) -> FakeLoad {
    let state = Arc::new(Mutex::new(state));
    let shared = Arc::clone(&state);
    let served = serve(move |mut stream| {
        let state = Arc::clone(&shared);
        async move {
            let mut pending = Vec::new();
            let mut buf = [0u8; 512];
            loop {
                let n = match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                pending.extend_from_slice(&buf[..n]);
                while let Some(frame) = take_load_frame(&mut pending) {
                    let reply = load_reply(&mut state.lock(), &frame);
                    if let Some(reply) = reply {
                        if stream.write_all(&reply).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    })
    .await;
    FakeLoad { served, state }
}

// ============================================================================
// Detection board
// ============================================================================

#[derive(Debug, Clone)]
pub struct VdcState {
    pub slave_id: u8,
    pub registers: HashMap<u16, u16>,
    pub requests: Vec<Vec<u8>>,
}

impl Default for VdcState {
    fn default() -> Self {
        let mut registers = HashMap::new();
        registers.insert(0x8000, 1);
        registers.insert(0x8001, 23);
        registers.insert(0x8002, 9600);
        registers.insert(0x8004, 0x0801);
        registers.insert(0x8008, 36);
        registers.insert(0x8009, 120);
        registers.insert(0x800A, 1);
        for i in 0..32u16 {
            registers.insert(0x8010 + i, 0x01F4);
            registers.insert(0x8030 + i, 0);
            registers.insert(0x8050 + i, 250);
        }
        for (i, pair) in b"VDC32-0001".chunks(2).enumerate() {
            registers.insert(0x8820 + i as u16, u16::from_be_bytes([pair[0], pair[1]]));
        }
        Self {
            slave_id: 1,
            registers,
            requests: Vec::new(),
        }
    }
}

pub struct FakeVdc {
    pub served: Served,
    pub state: Arc<Mutex<VdcState>>,
}

impl FakeVdc {
    pub fn transport(&self) -> TransportConfig {
        tcp_transport(self.served.addr)
    }

    pub fn register(&self, addr: u16) -> u16 {
        self.state.lock().registers.get(&addr).copied().unwrap_or(0)
    }
}

fn take_vdc_frame(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    if buf.len() < 2 {
        return None;
    }
    let len = match buf[1] {
        FC_READ_HOLDING => 7,
        FC_WRITE_MULTIPLE if buf.len() >= 7 => 9 + usize::from(buf[6]),
        FC_WRITE_MULTIPLE => return None,
        _ => buf.len(),
    };
    if buf.len() < len {
        return None;
    }
    Some(buf.drain(..len).collect())
}

fn vdc_reply(state: &mut VdcState, frame: &[u8]) -> Option<Vec<u8>> {
    state.requests.push(frame.to_vec());
    let payload = vdc_frame::decode(frame).ok()?;
    let slave = payload[0];
    if slave != state.slave_id && slave != vdc_frame::BROADCAST_SLAVE {
        return None;
    }
    let function = payload[1];
    let start = u16::from_be_bytes([payload[2], payload[3]]);
    let in_map = |addr: u16| (0x8000..0x8900).contains(&addr);

    let mut reply = match function {
        FC_READ_HOLDING => {
            let count = u16::from(payload[4]);
            if !in_map(start) {
                vec![slave, FC_READ_HOLDING | 0x80, 0x02]
            } else {
                let mut reply = vec![slave, FC_READ_HOLDING, (count * 2) as u8];
                for offset in 0..count {
                    let value = state.registers.get(&(start + offset)).copied().unwrap_or(0);
                    reply.extend_from_slice(&value.to_be_bytes());
                }
                reply
            }
        },
        FC_WRITE_MULTIPLE => {
            let values: Vec<u16> = payload[7..]
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            for (offset, value) in values.iter().enumerate() {
                state.registers.insert(start + offset as u16, *value);
            }
            if start == 0x8000 {
                state.slave_id = values[0] as u8;
            }
            let mut reply = vec![state.slave_id, FC_WRITE_MULTIPLE];
            reply.extend_from_slice(&payload[2..6]);
            reply
        },
        _ => vec![slave, function | 0x80, 0x01],
    };
    if slave == vdc_frame::BROADCAST_SLAVE {
        return None;
    }
    vdc_frame::append_crc(&mut reply);
    Some(reply)
}

pub async fn fake_vdc(state: VdcState) -> FakeVdc {
    let state = Arc::new(Mutex::new(state));
    let shared = Arc::clone(&state);
    let served = serve(move |mut stream| {
        let state = Arc::clone(&shared);
        async move {
            let mut pending = Vec::new();
            let mut buf = [0u8; 512];
            loop {
                let n = match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                pending.extend_from_slice(&buf[..n]);
                while let Some(frame) = take_vdc_frame(&mut pending) {
                    let reply = vdc_reply(&mut state.lock(), &frame);
                    if let Some(reply) = reply {
                        if stream.write_all(&reply).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    })
    .await;
    FakeVdc { served, state }
}
