//! `wg` and `systemctl` invocations
//!
//! Everything that touches the live interface goes through a
//! [`CommandRunner`], so tests can swap in a fake interface. Secrets never
//! appear on a command line: the private key is piped to `wg pubkey` and the
//! pre-shared key is handed to `wg set` as a 0600 temp file that is removed
//! when the call returns, whatever the outcome.

use crate::reconciler::InterfaceState;
use async_trait::async_trait;
use std::io::Write;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command as AsyncCommand;
use tracing::debug;
use wgwarden_common::{Error, KeyProvider, KeyTriple, PeerRecord, Result};

/// Captured result of one external command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    fn status(&self) -> String {
        match self.code {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Runs a program with arguments and optional stdin
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String], stdin: Option<&str>) -> std::io::Result<CommandOutput>;
}

/// Runs real processes with tokio, never through a shell
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, program: &str, args: &[String], stdin: Option<&str>) -> std::io::Result<CommandOutput> {
        let mut cmd = AsyncCommand::new(program);
        cmd.args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
            pipe.write_all(b"\n").await?;
            // Dropping the pipe closes it so the child sees EOF
        }

        let output = child.wait_with_output().await?;
        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Typed wrapper over the WireGuard toolkit for one interface
#[derive(Clone)]
pub struct WgTool {
    runner: Arc<dyn CommandRunner>,
    wg_binary: String,
    systemctl_binary: String,
    interface: String,
    service_unit: String,
}

impl WgTool {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        wg_binary: impl Into<String>,
        systemctl_binary: impl Into<String>,
        interface: impl Into<String>,
        service_unit: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            wg_binary: wg_binary.into(),
            systemctl_binary: systemctl_binary.into(),
            interface: interface.into(),
            service_unit: service_unit.into(),
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Run `program args..`, turning a spawn error or non-zero exit into
    /// `ExternalCommand` for peer `id`
    async fn exec(
        &self,
        op: &'static str,
        id: &str,
        program: &str,
        args: Vec<String>,
        stdin: Option<&str>,
    ) -> Result<String> {
        let command = format!("{} {}", program, args.join(" "));
        debug!("Running `{}`", command);

        let failed = |status: String, stderr: String| Error::ExternalCommand {
            op,
            id: id.to_string(),
            command: command.clone(),
            status,
            stderr,
        };

        let output = self
            .runner
            .run(program, &args, stdin)
            .await
            .map_err(|e| failed("spawn failed".to_string(), e.to_string()))?;

        if !output.success {
            return Err(failed(output.status(), output.stderr.trim().to_string()));
        }
        Ok(output.stdout.trim().to_string())
    }

    async fn wg(&self, op: &'static str, id: &str, args: &[&str], stdin: Option<&str>) -> Result<String> {
        let args = args.iter().map(|s| s.to_string()).collect();
        self.exec(op, id, &self.wg_binary, args, stdin).await
    }

    pub async fn genkey(&self) -> Result<String> {
        self.wg("generate_keys", "-", &["genkey"], None).await
    }

    pub async fn pubkey(&self, private_key: &str) -> Result<String> {
        self.wg("generate_keys", "-", &["pubkey"], Some(private_key)).await
    }

    pub async fn genpsk(&self) -> Result<String> {
        self.wg("generate_keys", "-", &["genpsk"], None).await
    }

    /// Live peers on the interface, from `wg show <iface> dump`
    pub async fn show(&self) -> Result<InterfaceState> {
        let dump = self
            .wg("observe_interface", "-", &["show", &self.interface, "dump"], None)
            .await?;
        Ok(InterfaceState::parse_dump(&dump))
    }

    /// Install or update a peer; repeating it is harmless
    pub async fn apply_peer(&self, record: &PeerRecord) -> Result<()> {
        let mut psk = tempfile::Builder::new().prefix("wgwarden-psk-").tempfile()?;
        writeln!(psk, "{}", record.preshared_key)?;
        psk.as_file().sync_all()?;

        let psk_path = psk.path().to_string_lossy().into_owned();
        let allowed_ip = record.allowed_ip();
        self.wg(
            "apply_peer",
            &record.id,
            &[
                "set",
                &self.interface,
                "peer",
                &record.public_key,
                "preshared-key",
                &psk_path,
                "allowed-ips",
                &allowed_ip,
            ],
            None,
        )
        .await
        .map(|_| ())
        // `psk` drops here on every path, deleting the file
    }

    /// Remove a peer by public key; removing an absent peer is not an error
    pub async fn remove_peer(&self, id: &str, public_key: &str) -> Result<()> {
        self.wg(
            "remove_peer",
            id,
            &["set", &self.interface, "peer", public_key, "remove"],
            None,
        )
        .await
        .map(|_| ())
    }

    pub async fn restart_service(&self) -> Result<()> {
        let args = vec!["restart".to_string(), self.service_unit.clone()];
        self.exec("restart_service", "-", &self.systemctl_binary, args, None)
            .await
            .map(|_| ())
    }
}

/// Keys from `wg genkey`, `wg pubkey` and `wg genpsk`
pub struct ToolkitKeyProvider {
    wg: WgTool,
}

impl ToolkitKeyProvider {
    pub fn new(wg: WgTool) -> Self {
        Self { wg }
    }
}

#[async_trait]
impl KeyProvider for ToolkitKeyProvider {
    fn name(&self) -> &'static str {
        "toolkit"
    }

    async fn generate(&self) -> Result<KeyTriple> {
        let to_keygen = |e: Error| Error::key_generation("create_peer", e);

        let private_key = self.wg.genkey().await.map_err(to_keygen)?;
        let public_key = self.wg.pubkey(&private_key).await.map_err(to_keygen)?;
        let preshared_key = self.wg.genpsk().await.map_err(to_keygen)?;

        for (label, key) in [("private", &private_key), ("public", &public_key), ("pre-shared", &preshared_key)] {
            if key.is_empty() {
                return Err(Error::key_generation(
                    "create_peer",
                    format!("wg returned an empty {} key", label),
                ));
            }
        }

        Ok(KeyTriple {
            private_key,
            public_key,
            preshared_key,
        })
    }
}

#[cfg(test)]
pub mod fake {
    //! In-memory stand-in for a live WireGuard interface

    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct FakePeer {
        pub public_key: String,
        pub allowed_ips: String,
        pub preshared_key: String,
    }

    #[derive(Default)]
    struct Inner {
        peers: Vec<FakePeer>,
        calls: Vec<Vec<String>>,
        failing: HashSet<String>,
        broken_keygen: bool,
        broken_show: bool,
        psk_paths: Vec<String>,
        keys_issued: u64,
    }

    /// Models `wg` and `systemctl` against an in-memory peer table and
    /// records every invocation
    #[derive(Default)]
    pub struct FakeInterface {
        inner: Mutex<Inner>,
    }

    impl FakeInterface {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn tool(self: &Arc<Self>) -> WgTool {
            WgTool::new(self.clone(), "wg", "systemctl", "wg0", "wg-quick@wg0")
        }

        /// Pre-populate a live peer
        pub fn insert(&self, public_key: &str, allowed_ips: &str) {
            self.inner.lock().peers.push(FakePeer {
                public_key: public_key.to_string(),
                allowed_ips: allowed_ips.to_string(),
                preshared_key: String::new(),
            });
        }

        pub fn peers(&self) -> Vec<FakePeer> {
            self.inner.lock().peers.clone()
        }

        pub fn peer(&self, public_key: &str) -> Option<FakePeer> {
            self.inner.lock().peers.iter().find(|p| p.public_key == public_key).cloned()
        }

        pub fn calls(&self) -> Vec<Vec<String>> {
            self.inner.lock().calls.clone()
        }

        pub fn clear_calls(&self) {
            self.inner.lock().calls.clear();
        }

        /// `wg set` calls of the given kind (`"remove"` or `"preshared-key"`)
        pub fn set_calls(&self, kind: &str) -> Vec<Vec<String>> {
            self.calls()
                .into_iter()
                .filter(|c| c.get(1).map(String::as_str) == Some("set") && c.iter().any(|a| a == kind))
                .collect()
        }

        pub fn restarts(&self) -> usize {
            self.calls().iter().filter(|c| c[0] == "systemctl").count()
        }

        /// Make every `wg set` for this public key fail
        pub fn fail_for(&self, public_key: &str) {
            self.inner.lock().failing.insert(public_key.to_string());
        }

        pub fn break_keygen(&self) {
            self.inner.lock().broken_keygen = true;
        }

        pub fn break_show(&self) {
            self.inner.lock().broken_show = true;
        }

        pub fn psk_paths(&self) -> Vec<String> {
            self.inner.lock().psk_paths.clone()
        }

        fn ok(stdout: impl Into<String>) -> CommandOutput {
            CommandOutput {
                success: true,
                code: Some(0),
                stdout: stdout.into(),
                stderr: String::new(),
            }
        }

        fn fail(stderr: &str) -> CommandOutput {
            CommandOutput {
                success: false,
                code: Some(1),
                stdout: String::new(),
                stderr: stderr.to_string(),
            }
        }

        fn handle_wg(inner: &mut Inner, args: &[String], stdin: Option<&str>) -> CommandOutput {
            let argv: Vec<&str> = args.iter().map(String::as_str).collect();
            if let ["set", _, "peer", _, "preshared-key", psk_path, ..] = argv.as_slice() {
                inner.psk_paths.push(psk_path.to_string());
            }
            match argv.as_slice() {
                ["genkey"] | ["genpsk"] if inner.broken_keygen => Self::fail("Unable to open /dev/urandom"),
                ["genkey"] => {
                    inner.keys_issued += 1;
                    Self::ok(format!("PRIV{}", inner.keys_issued))
                }
                ["pubkey"] => match stdin {
                    Some(private) => Self::ok(format!("PUB-{}", private.trim())),
                    None => Self::fail("Key is not the correct length or format"),
                },
                ["genpsk"] => {
                    inner.keys_issued += 1;
                    Self::ok(format!("PSK{}", inner.keys_issued))
                }
                ["show", _, "dump"] if inner.broken_show => Self::fail("Unable to access interface: No such device"),
                ["show", _, "dump"] => {
                    let mut out = String::from("SERVERPRIV\tSERVERPUB\t51820\toff\n");
                    for p in &inner.peers {
                        let allowed = if p.allowed_ips.is_empty() { "(none)" } else { p.allowed_ips.as_str() };
                        out.push_str(&format!("{}\t(hidden)\t(none)\t{}\t0\t0\t0\toff\n", p.public_key, allowed));
                    }
                    Self::ok(out)
                }
                ["set", _, "peer", public_key, ..] if inner.failing.contains(*public_key) => {
                    Self::fail("Unable to modify interface: Protocol not supported")
                }
                ["set", _, "peer", public_key, "remove"] => {
                    inner.peers.retain(|p| p.public_key != *public_key);
                    Self::ok("")
                }
                ["set", _, "peer", public_key, "preshared-key", psk_path, "allowed-ips", allowed] => {
                    let preshared_key = match std::fs::read_to_string(psk_path) {
                        Ok(psk) => psk.trim().to_string(),
                        Err(_) => return Self::fail("Unable to read pre-shared key file"),
                    };
                    let peer = FakePeer {
                        public_key: public_key.to_string(),
                        allowed_ips: allowed.to_string(),
                        preshared_key,
                    };
                    match inner.peers.iter_mut().find(|p| p.public_key == *public_key) {
                        Some(slot) => *slot = peer,
                        None => inner.peers.push(peer),
                    }
                    Self::ok("")
                }
                _ => Self::fail("Invalid subcommand"),
            }
        }
    }

    #[async_trait]
    impl CommandRunner for FakeInterface {
        async fn run(&self, program: &str, args: &[String], stdin: Option<&str>) -> std::io::Result<CommandOutput> {
            let mut inner = self.inner.lock();
            let mut call = vec![program.to_string()];
            call.extend(args.iter().cloned());
            inner.calls.push(call);

            Ok(match program {
                "wg" => Self::handle_wg(&mut inner, args, stdin),
                "systemctl" => Self::ok(""),
                _ => Self::fail("command not found"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeInterface;
    use super::*;
    use wgwarden_common::{ExpiryDate, Timestamp};

    fn record() -> PeerRecord {
        PeerRecord {
            id: "id1".to_string(),
            name: "ivan".to_string(),
            address: "10.8.0.2".parse().unwrap(),
            private_key: "PRIV1".to_string(),
            public_key: "PUB-PRIV1".to_string(),
            preshared_key: "PSK-SECRET".to_string(),
            expires_at: ExpiryDate::from_ymd(2025, 7, 1).unwrap(),
            created_at: Timestamp::now(),
        }
    }

    #[tokio::test]
    async fn test_toolkit_keys() {
        let fake = FakeInterface::new();
        let keys = ToolkitKeyProvider::new(fake.tool()).generate().await.unwrap();

        assert_eq!(keys.private_key, "PRIV1");
        assert_eq!(keys.public_key, "PUB-PRIV1");
        assert_eq!(keys.preshared_key, "PSK2");
        // The private key went over stdin, not argv
        assert!(fake.calls().iter().all(|c| !c.contains(&"PRIV1".to_string())));
    }

    #[tokio::test]
    async fn test_toolkit_failure_is_key_generation_error() {
        let fake = FakeInterface::new();
        fake.break_keygen();

        let err = ToolkitKeyProvider::new(fake.tool()).generate().await.unwrap_err();
        assert!(matches!(err, Error::KeyGeneration { op: "create_peer", .. }));
    }

    #[tokio::test]
    async fn test_apply_keeps_psk_off_argv() {
        let fake = FakeInterface::new();
        let wg = fake.tool();
        wg.apply_peer(&record()).await.unwrap();

        let live = fake.peer("PUB-PRIV1").unwrap();
        assert_eq!(live.preshared_key, "PSK-SECRET");
        assert_eq!(live.allowed_ips, "10.8.0.2/32");
        assert!(fake
            .calls()
            .iter()
            .all(|c| c.iter().all(|arg| !arg.contains("PSK-SECRET"))));

        // The temp file is gone once the call returns
        for path in fake.psk_paths() {
            assert!(!std::path::Path::new(&path).exists());
        }
    }

    #[tokio::test]
    async fn test_psk_file_removed_on_failure() {
        let fake = FakeInterface::new();
        fake.fail_for("PUB-PRIV1");

        let err = fake.tool().apply_peer(&record()).await.unwrap_err();
        match err {
            Error::ExternalCommand { op, id, status, .. } => {
                assert_eq!(op, "apply_peer");
                assert_eq!(id, "id1");
                assert_eq!(status, "exit code 1");
            }
            other => panic!("unexpected error: {other}"),
        }

        let paths = fake.psk_paths();
        assert_eq!(paths.len(), 1);
        assert!(!std::path::Path::new(&paths[0]).exists());
    }

    #[tokio::test]
    async fn test_remove_absent_peer_is_ok() {
        let fake = FakeInterface::new();
        fake.tool().remove_peer("id1", "PUB-NOBODY").await.unwrap();
        assert_eq!(fake.set_calls("remove").len(), 1);
    }

    #[tokio::test]
    async fn test_show_parses_dump() {
        let fake = FakeInterface::new();
        fake.insert("A", "10.8.0.2/32");
        fake.insert("B", "");

        let live = fake.tool().show().await.unwrap();
        assert_eq!(live.len(), 2);
        assert!(live.has_allowed_ip("A", "10.8.0.2/32"));
        assert!(live.contains("B"));
        assert!(!live.has_allowed_ip("B", "10.8.0.3/32"));
    }
}
