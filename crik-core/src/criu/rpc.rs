//! Wire-level client for the checkpoint engine's `swrk` RPC mode.
//!
//! The engine is spawned as `criu swrk <fd>` with one end of a SOCK_SEQPACKET
//! socket pair and spoken to in length-delimited protobuf messages. The
//! message structs below carry the engine's `rpc.proto` field tags; only the
//! subset this crate actually sets or reads is declared, unknown fields are
//! skipped on decode.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use prost::Message;

use crate::error::DumpError;

/// RPC request/response discriminator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum CriuReqType {
    Empty = 0,
    Dump = 1,
    Restore = 2,
    Check = 3,
    PreDump = 4,
    PageServer = 5,
    Notify = 6,
    CpuinfoDump = 7,
    CpuinfoCheck = 8,
    FeatureCheck = 9,
    Version = 10,
    WaitPid = 11,
    PageServerChld = 12,
}

/// How the engine should treat cgroups.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum CriuCgMode {
    Ignore = 0,
    CgNone = 1,
    Props = 2,
    Soft = 3,
    Full = 4,
    Strict = 5,
    Default = 6,
}

/// Engine option set. Field tags follow the engine's `rpc.proto`.
#[derive(Clone, PartialEq, Message)]
pub struct CriuOpts {
    #[prost(int32, optional, tag = "1")]
    pub images_dir_fd: Option<i32>,
    #[prost(int32, optional, tag = "2")]
    pub pid: Option<i32>,
    #[prost(bool, optional, tag = "3")]
    pub leave_running: Option<bool>,
    #[prost(bool, optional, tag = "5")]
    pub tcp_established: Option<bool>,
    #[prost(bool, optional, tag = "7")]
    pub shell_job: Option<bool>,
    #[prost(bool, optional, tag = "8")]
    pub file_locks: Option<bool>,
    #[prost(int32, optional, tag = "9")]
    pub log_level: Option<i32>,
    #[prost(string, optional, tag = "10")]
    pub log_file: Option<String>,
    #[prost(bool, optional, tag = "12")]
    pub notify_scripts: Option<bool>,
    #[prost(string, optional, tag = "13")]
    pub root: Option<String>,
    #[prost(bool, optional, tag = "16")]
    pub auto_dedup: Option<bool>,
    #[prost(enumeration = "CriuCgMode", optional, tag = "34")]
    pub manage_cgroups_mode: Option<i32>,
    #[prost(uint32, optional, tag = "35")]
    pub ghost_limit: Option<u32>,
    #[prost(string, repeated, tag = "37")]
    pub external: Vec<String>,
    #[prost(bool, optional, tag = "48")]
    pub lazy_pages: Option<bool>,
    #[prost(bool, optional, tag = "50")]
    pub orphan_pts_master: Option<bool>,
    #[prost(bool, optional, tag = "52")]
    pub tcp_close: Option<bool>,
    #[prost(bool, optional, tag = "68")]
    pub leave_stopped: Option<bool>,
}

/// Notification sent by the engine while a request is in flight.
#[derive(Clone, PartialEq, Message)]
pub struct CriuNotify {
    #[prost(string, optional, tag = "1")]
    pub script: Option<String>,
    #[prost(int32, optional, tag = "2")]
    pub pid: Option<i32>,
}

/// Engine version report.
#[derive(Clone, PartialEq, Message)]
pub struct CriuVersion {
    #[prost(int32, optional, tag = "1")]
    pub major_number: Option<i32>,
    #[prost(int32, optional, tag = "2")]
    pub minor_number: Option<i32>,
    #[prost(string, optional, tag = "3")]
    pub gitid: Option<String>,
    #[prost(int32, optional, tag = "4")]
    pub sublevel: Option<i32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CriuReq {
    #[prost(enumeration = "CriuReqType", tag = "1")]
    pub r#type: i32,
    #[prost(message, optional, tag = "2")]
    pub opts: Option<CriuOpts>,
    #[prost(bool, optional, tag = "3")]
    pub notify_success: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CriuResp {
    #[prost(enumeration = "CriuReqType", tag = "1")]
    pub r#type: i32,
    #[prost(bool, tag = "2")]
    pub success: bool,
    #[prost(message, optional, tag = "5")]
    pub notify: Option<CriuNotify>,
    #[prost(int32, optional, tag = "7")]
    pub cr_errno: Option<i32>,
    #[prost(string, optional, tag = "9")]
    pub cr_errmsg: Option<String>,
    #[prost(message, optional, tag = "10")]
    pub version: Option<CriuVersion>,
}

/// Hooks invoked when the engine sends a NOTIFY message during a request.
/// Each notification is acked back to the engine; a hook error fails the
/// whole request.
pub trait NotifyHandler {
    fn pre_dump(&mut self) -> Result<(), DumpError> {
        Ok(())
    }
    fn post_dump(&mut self) -> Result<(), DumpError> {
        Ok(())
    }
}

/// A no-op handler for requests that do not expect notifications.
struct NopHandler;

impl NotifyHandler for NopHandler {}

fn dispatch_notify(handler: &mut dyn NotifyHandler, script: &str) -> Result<(), DumpError> {
    match script {
        "pre-dump" => handler.pre_dump(),
        "post-dump" => handler.post_dump(),
        // network-lock, network-unlock, post-resume and friends need no
        // action here.
        _ => Ok(()),
    }
}

fn request_name(ty: CriuReqType) -> &'static str {
    match ty {
        CriuReqType::Dump => "dump",
        CriuReqType::Version => "version",
        _ => "rpc",
    }
}

/// Checkpoint engine handle.
pub struct Criu {
    criu_path: PathBuf,
}

impl Criu {
    /// Drive the `criu` binary found on PATH.
    pub fn new() -> Self {
        Self::with_criu_path("criu")
    }

    pub fn with_criu_path(path: impl Into<PathBuf>) -> Self {
        Self {
            criu_path: path.into(),
        }
    }

    /// Ask the engine for its version, encoded as major*10000 + minor*100 +
    /// sublevel.
    pub fn version(&self) -> Result<u32, DumpError> {
        let response = self.round_trip(CriuReqType::Version, None, &mut NopHandler)?;
        Ok(version_number(response.version.as_ref().unwrap_or(&CriuVersion::default())))
    }

    /// Dump the process named in `opts`, servicing engine notifications
    /// through `handler`.
    pub fn dump(&self, opts: CriuOpts, handler: &mut dyn NotifyHandler) -> Result<(), DumpError> {
        self.round_trip(CriuReqType::Dump, Some(opts), handler)?;
        Ok(())
    }

    fn round_trip(
        &self,
        ty: CriuReqType,
        opts: Option<CriuOpts>,
        handler: &mut dyn NotifyHandler,
    ) -> Result<CriuResp, DumpError> {
        // The engine end must stay inheritable, so no SOCK_CLOEXEC here.
        let (ours, theirs) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::empty(),
        )
        .map_err(|source| DumpError::Socketpair { source })?;

        let mut engine = Command::new(&self.criu_path)
            .arg("swrk")
            .arg(theirs.as_raw_fd().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| DumpError::SpawnEngine { source })?;
        // The engine owns its end now; keeping ours only.
        drop(theirs);

        let mut sock = File::from(ours);
        let req = CriuReq {
            r#type: ty as i32,
            opts,
            notify_success: None,
        };
        sock.write_all(&req.encode_to_vec())
            .map_err(|source| self.fail(&mut engine, DumpError::RpcSend { source }))?;

        let result = self.response_loop(&mut sock, &mut engine, ty, handler);
        let _ = engine.wait();
        result
    }

    fn response_loop(
        &self,
        sock: &mut File,
        engine: &mut Child,
        ty: CriuReqType,
        handler: &mut dyn NotifyHandler,
    ) -> Result<CriuResp, DumpError> {
        // One SEQPACKET datagram per read; sized generously above the
        // engine's largest response.
        let mut buffer = vec![0u8; 10 * 4096];
        loop {
            let n = sock
                .read(&mut buffer)
                .map_err(|source| self.fail(engine, DumpError::RpcRecv { source }))?;
            if n == 0 {
                return Err(self.fail(engine, DumpError::RpcClosed));
            }
            if n == buffer.len() {
                // A full buffer may mean a truncated datagram; refuse to
                // parse it.
                return Err(self.fail(engine, DumpError::RpcResponseTooLarge));
            }

            let response = CriuResp::decode(&buffer[..n])
                .map_err(|source| self.fail(engine, DumpError::RpcDecode { source }))?;

            if !response.success {
                return Err(self.fail(
                    engine,
                    DumpError::EngineFailed {
                        request: request_name(ty),
                        errno: response.cr_errno.unwrap_or(0),
                        message: response
                            .cr_errmsg
                            .map(|m| format!(": {m}"))
                            .unwrap_or_default(),
                    },
                ));
            }

            if response.r#type == CriuReqType::Notify as i32 {
                let script = response
                    .notify
                    .as_ref()
                    .and_then(|n| n.script.as_deref())
                    .unwrap_or("");
                tracing::debug!(script, "engine notification");
                let hook_result = dispatch_notify(handler, script);

                let ack = CriuReq {
                    r#type: CriuReqType::Notify as i32,
                    opts: None,
                    notify_success: Some(hook_result.is_ok()),
                };
                sock.write_all(&ack.encode_to_vec())
                    .map_err(|source| self.fail(engine, DumpError::RpcSend { source }))?;
                hook_result?;
                continue;
            }

            if response.r#type != ty as i32 {
                let got = CriuReqType::try_from(response.r#type)
                    .map(|t| format!("{t:?}"))
                    .unwrap_or_else(|_| response.r#type.to_string());
                return Err(self.fail(
                    engine,
                    DumpError::UnexpectedResponse {
                        expected: request_name(ty),
                        got,
                    },
                ));
            }
            return Ok(response);
        }
    }

    /// Make sure a failed exchange does not leave the engine running.
    fn fail(&self, engine: &mut Child, err: DumpError) -> DumpError {
        let _ = engine.kill();
        err
    }
}

impl Default for Criu {
    fn default() -> Self {
        Self::new()
    }
}

fn version_number(version: &CriuVersion) -> u32 {
    let mut number = (version.major_number.unwrap_or(0) * 10000
        + version.minor_number.unwrap_or(0) * 100
        + version.sublevel.unwrap_or(0)) as u32;
    if version.gitid.is_some() {
        // Git builds count as the next minor release.
        number -= number % 100;
        number += 100;
    }
    number
}
