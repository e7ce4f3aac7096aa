//! External-tool backend: shells out to the installed `gpg` executable.
//!
//! The one interesting problem here is that gpg's command line is not
//! stable across release lines: the agent toggle disappeared in 2.1,
//! `--passphrase-fd` needs `--batch` from 2.0 and additionally
//! `--pinentry-mode loopback` from 2.1, and `--secret-keyring` became a
//! warned-about no-op in 2.1.  So `prepare` probes `gpg --version` once,
//! and [`build_args`] gates every flag on the detected [`GpgVersion`].
//!
//! The passphrase is fed over the child's stdin (`--passphrase-fd 0`),
//! newline-terminated exactly once, and never appears in arguments or logs.

use std::ffi::OsString;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

use tracing::{debug, warn, Level};

use crate::config::SignerConfig;
use crate::error::SignError;
use crate::version::GpgVersion;
use crate::Signer;

/// Detached signing via the external gpg executable.
pub struct GpgCommandSigner {
    config: SignerConfig,
    version: Option<GpgVersion>,
}

impl GpgCommandSigner {
    pub fn new(config: SignerConfig) -> Self {
        Self {
            config,
            version: None,
        }
    }

    fn executable(&self) -> &str {
        match &self.config.executable {
            Some(executable) if !executable.is_empty() => executable,
            _ => default_executable(),
        }
    }
}

fn default_executable() -> &'static str {
    if cfg!(windows) {
        "gpg.exe"
    } else {
        "gpg"
    }
}

impl Signer for GpgCommandSigner {
    fn name(&self) -> &'static str {
        "gpg"
    }

    fn prepare(&mut self) -> Result<(), SignError> {
        let version = detect_version(self.executable())?;
        debug!(%version, "detected gpg");
        self.version = Some(version);
        Ok(())
    }

    fn sign_to(&self, source: &Path, dest: &Path) -> Result<(), SignError> {
        let version = self
            .version
            .as_ref()
            .ok_or_else(|| SignError::Config("signer is not prepared".to_string()))?;

        let args = build_args(&self.config, version, source, dest);
        debug!("CMD: {} {:?}", self.executable(), args);

        let mut command = Command::new(self.executable());
        command
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command.stdin(if self.config.passphrase.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command.spawn().map_err(SignError::ProcessLaunch)?;

        if let Some(passphrase) = &self.config.passphrase {
            let mut stdin = child.stdin.take().ok_or_else(|| {
                SignError::Io(std::io::Error::other("child stdin was not piped"))
            })?;
            stdin.write_all(passphrase.as_str().as_bytes())?;
            if !passphrase.as_str().ends_with('\n') {
                stdin.write_all(b"\n")?;
            }
            // Dropping the handle closes the descriptor so gpg sees EOF.
        }

        let output = child.wait_with_output()?;
        if !output.stderr.is_empty() {
            debug!("gpg stderr: {}", String::from_utf8_lossy(&output.stderr));
        }
        if !output.status.success() {
            return Err(SignError::ProcessFailed {
                code: output.status.code().unwrap_or(-1),
            });
        }
        Ok(())
    }

    fn key_info(&self) -> String {
        match &self.config.key_name {
            Some(key_name) => key_name.clone(),
            None => "default key".to_string(),
        }
    }
}

/// Run `gpg --version` and parse the banner line.
fn detect_version(executable: &str) -> Result<GpgVersion, SignError> {
    let output = Command::new(executable)
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .map_err(SignError::ProcessLaunch)?;
    if !output.status.success() {
        return Err(SignError::ProcessFailed {
            code: output.status.code().unwrap_or(-1),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let banner = stdout
        .lines()
        .find(|line| is_banner_line(line))
        .ok_or_else(|| SignError::VersionParse(stdout.lines().next().unwrap_or("").to_string()))?;
    GpgVersion::parse(banner)
}

/// `gpg (GnuPG) 2.2.15`: implementation name in parentheses, then the rest.
fn is_banner_line(line: &str) -> bool {
    let Some(rest) = line.strip_prefix("gpg (") else {
        return false;
    };
    match rest.split_once(')') {
        Some((implementation, tail)) => !implementation.is_empty() && !tail.trim().is_empty(),
        None => false,
    }
}

/// Build the full argument vector for one signing invocation.
///
/// Flag order matters to gpg's parser; this follows the layout its own
/// documentation expects: options first, `--output` second to last, the
/// input file last.
fn build_args(
    config: &SignerConfig,
    version: &GpgVersion,
    source: &Path,
    dest: &Path,
) -> Vec<OsString> {
    let v2_0 = GpgVersion::from_segments(&[2, 0]);
    let v2_1 = GpgVersion::from_segments(&[2, 1]);

    let mut args: Vec<OsString> = Vec::new();

    for arg in &config.extra_args {
        args.push(arg.into());
    }

    if let Some(home_dir) = &config.home_dir {
        args.push("--homedir".into());
        args.push(home_dir.as_os_str().to_os_string());
    }

    // 2.1 removed the agent toggle and always behaves as if agent-enabled.
    if version.is_before(&v2_1) {
        args.push(
            if config.use_agent {
                "--use-agent"
            } else {
                "--no-use-agent"
            }
            .into(),
        );
    }

    if config.passphrase.is_some() {
        if version.is_at_least(&v2_0) {
            // Required for --passphrase-fd since 2.0.
            args.push("--batch".into());
        }
        if version.is_at_least(&v2_1) {
            // Required for --passphrase-fd since 2.1.
            args.push("--pinentry-mode".into());
            args.push("loopback".into());
        }
        args.push("--passphrase-fd".into());
        args.push("0".into());
    }

    if let Some(key_name) = &config.key_name {
        args.push("--local-user".into());
        args.push(key_name.into());
    }

    args.push("--armor".into());
    args.push("--detach-sign".into());

    if tracing::enabled!(Level::DEBUG) {
        // Status information on stdout, distinguishable from normal logs.
        args.push("--status-fd".into());
        args.push("1".into());
    }

    if !config.interactive {
        args.push("--batch".into());
        args.push("--no-tty".into());
        if config.passphrase.is_none() && version.is_at_least(&v2_1) {
            // Fail instead of blocking on a prompt we cannot show.
            args.push("--pinentry-mode".into());
            args.push("error".into());
        }
    }

    if !config.default_keyring {
        args.push("--no-default-keyring".into());
    }

    if let Some(secret_keyring) = &config.secret_keyring {
        if version.is_before(&v2_1) {
            args.push("--secret-keyring".into());
            args.push(secret_keyring.into());
        } else {
            warn!(
                "'secret_keyring' is an obsolete option and ignored; all secret keys \
                 are stored in the 'private-keys-v1.d' directory below the GnuPG home"
            );
        }
    }

    if let Some(public_keyring) = &config.public_keyring {
        args.push("--keyring".into());
        args.push(public_keyring.into());
    }

    if let Some(lock_mode) = &config.lock_mode {
        match lock_mode.to_ascii_lowercase().as_str() {
            "once" => args.push("--lock-once".into()),
            "multiple" => args.push("--lock-multiple".into()),
            "never" => args.push("--lock-never".into()),
            other => warn!("unrecognised lock mode {other:?}, ignoring"),
        }
    }

    args.push("--output".into());
    args.push(dest.as_os_str().to_os_string());
    args.push(source.as_os_str().to_os_string());

    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(s: &str) -> GpgVersion {
        GpgVersion::parse(s).unwrap()
    }

    fn args_as_strings(config: &SignerConfig, v: &str) -> Vec<String> {
        build_args(
            config,
            &version(v),
            Path::new("artifact.jar"),
            Path::new("artifact.jar.asc"),
        )
        .into_iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect()
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn banner_line_detection() {
        assert!(is_banner_line("gpg (GnuPG) 2.2.19"));
        assert!(is_banner_line("gpg (GnuPG/MacGPG2) 2.2.10"));
        assert!(!is_banner_line("libgcrypt 1.8.5"));
        assert!(!is_banner_line("gpg: no default secret key"));
        assert!(!is_banner_line("gpg ()"));
    }

    #[test]
    fn legacy_gpg_gets_the_agent_toggle_and_no_pinentry_mode() {
        let config = SignerConfig {
            passphrase: Some("secret".into()),
            ..Default::default()
        };
        let args = args_as_strings(&config, "1.4.23");
        assert!(args.contains(&"--use-agent".to_string()));
        assert!(!args.iter().any(|a| a == "--pinentry-mode"));
        // 1.4 predates the --batch requirement too.
        assert!(!args.contains(&"--batch".to_string()));
        assert!(has_pair(&args, "--passphrase-fd", "0"));

        let config = SignerConfig {
            use_agent: false,
            ..Default::default()
        };
        let args = args_as_strings(&config, "1.4.23");
        assert!(args.contains(&"--no-use-agent".to_string()));
    }

    #[test]
    fn gpg_2_0_adds_batch_for_the_passphrase_descriptor() {
        let config = SignerConfig {
            passphrase: Some("secret".into()),
            ..Default::default()
        };
        let args = args_as_strings(&config, "2.0.26");
        assert!(args.contains(&"--batch".to_string()));
        assert!(!args.iter().any(|a| a == "--pinentry-mode"));
        assert!(has_pair(&args, "--passphrase-fd", "0"));
    }

    #[test]
    fn modern_gpg_drops_the_agent_toggle_and_uses_loopback_pinentry() {
        let config = SignerConfig {
            passphrase: Some("secret".into()),
            ..Default::default()
        };
        let args = args_as_strings(&config, "2.2.19");
        assert!(!args.iter().any(|a| a == "--use-agent" || a == "--no-use-agent"));
        assert!(args.contains(&"--batch".to_string()));
        assert!(has_pair(&args, "--pinentry-mode", "loopback"));
        assert!(has_pair(&args, "--passphrase-fd", "0"));
    }

    #[test]
    fn non_interactive_without_passphrase_errors_pinentry_on_2_1_plus() {
        let config = SignerConfig {
            interactive: false,
            ..Default::default()
        };
        let args = args_as_strings(&config, "2.2.19");
        assert!(args.contains(&"--no-tty".to_string()));
        assert!(args.contains(&"--batch".to_string()));
        assert!(has_pair(&args, "--pinentry-mode", "error"));

        let args = args_as_strings(&config, "1.4.23");
        assert!(args.contains(&"--no-tty".to_string()));
        assert!(!args.iter().any(|a| a == "--pinentry-mode"));
    }

    #[test]
    fn secret_keyring_only_passes_on_pre_2_1() {
        let config = SignerConfig {
            secret_keyring: Some("secring.gpg".to_string()),
            ..Default::default()
        };
        let args = args_as_strings(&config, "2.0.26");
        assert!(has_pair(&args, "--secret-keyring", "secring.gpg"));

        let args = args_as_strings(&config, "2.2.19");
        assert!(!args.iter().any(|a| a == "--secret-keyring"));
    }

    #[test]
    fn lock_modes_map_case_insensitively_and_unknown_is_ignored() {
        for (mode, flag) in [
            ("once", "--lock-once"),
            ("Multiple", "--lock-multiple"),
            ("NEVER", "--lock-never"),
        ] {
            let config = SignerConfig {
                lock_mode: Some(mode.to_string()),
                ..Default::default()
            };
            assert!(args_as_strings(&config, "2.2.19").contains(&flag.to_string()));
        }

        let config = SignerConfig {
            lock_mode: Some("sometimes".to_string()),
            ..Default::default()
        };
        assert!(!args_as_strings(&config, "2.2.19").iter().any(|a| a.starts_with("--lock")));
    }

    #[test]
    fn argument_order_extra_args_first_input_file_last() {
        let config = SignerConfig {
            extra_args: vec!["--verbose".to_string()],
            home_dir: Some("/tmp/gnupg".into()),
            key_name: Some("AABBCCDD".to_string()),
            ..Default::default()
        };
        let args = args_as_strings(&config, "2.2.19");
        assert_eq!(args[0], "--verbose");
        assert_eq!(args[1], "--homedir");
        assert_eq!(args[args.len() - 1], "artifact.jar");
        assert_eq!(args[args.len() - 3], "--output");
        assert_eq!(args[args.len() - 2], "artifact.jar.asc");
        // --armor --detach-sign always present, in that order.
        let armor = args.iter().position(|a| a == "--armor").unwrap();
        assert_eq!(args[armor + 1], "--detach-sign");
    }

    #[cfg(unix)]
    mod with_fake_gpg {
        use std::os::unix::fs::PermissionsExt;

        use super::*;
        use crate::sign_file;

        fn write_script(dir: &Path, body: &str) -> std::path::PathBuf {
            let path = dir.join("fake-gpg");
            std::fs::write(&path, body).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        const FAKE_GPG: &str = r#"#!/bin/sh
if [ "$1" = "--version" ]; then
    echo "gpg (GnuPG) 2.2.19"
    echo "libgcrypt 1.8.5"
    exit 0
fi
out=""
prev=""
for a in "$@"; do
    if [ "$prev" = "--output" ]; then out="$a"; fi
    prev="$a"
done
cat > /dev/null
echo "fake signature" > "$out"
"#;

        #[test]
        fn detects_version_from_the_banner() {
            let dir = tempfile::tempdir().unwrap();
            let script = write_script(dir.path(), FAKE_GPG);
            let v = detect_version(script.to_str().unwrap()).unwrap();
            assert_eq!(v, GpgVersion::parse("2.2.19").unwrap());
        }

        #[test]
        fn prepare_then_sign_writes_the_signature_file() {
            let dir = tempfile::tempdir().unwrap();
            let script = write_script(dir.path(), FAKE_GPG);
            let artifact = dir.path().join("artifact.jar");
            std::fs::write(&artifact, b"contents").unwrap();

            let mut signer = GpgCommandSigner::new(SignerConfig {
                executable: Some(script.to_str().unwrap().to_string()),
                passphrase: Some("secret".into()),
                ..Default::default()
            });
            signer.prepare().unwrap();
            let signature = sign_file(&signer, &artifact).unwrap();
            assert_eq!(signature, dir.path().join("artifact.jar.asc"));
            assert_eq!(std::fs::read(&signature).unwrap(), b"fake signature\n");
        }

        #[test]
        fn signing_before_prepare_is_a_configuration_error() {
            let signer = GpgCommandSigner::new(SignerConfig::default());
            let err = signer
                .sign_to(Path::new("a"), Path::new("a.asc"))
                .unwrap_err();
            assert!(matches!(err, SignError::Config(_)));
        }

        #[test]
        fn nonzero_exit_reports_the_code() {
            let dir = tempfile::tempdir().unwrap();
            let script = write_script(
                dir.path(),
                "#!/bin/sh\nif [ \"$1\" = \"--version\" ]; then echo \"gpg (GnuPG) 2.2.19\"; exit 0; fi\nexit 2\n",
            );
            let artifact = dir.path().join("artifact.jar");
            std::fs::write(&artifact, b"contents").unwrap();

            let mut signer = GpgCommandSigner::new(SignerConfig {
                executable: Some(script.to_str().unwrap().to_string()),
                ..Default::default()
            });
            signer.prepare().unwrap();
            let err = signer
                .sign_to(&artifact, &dir.path().join("artifact.jar.asc"))
                .unwrap_err();
            assert!(matches!(err, SignError::ProcessFailed { code: 2 }));
        }

        #[test]
        fn missing_executable_is_a_launch_error() {
            assert!(matches!(
                detect_version("/no/such/gpg"),
                Err(SignError::ProcessLaunch(_))
            ));
        }
    }
}
