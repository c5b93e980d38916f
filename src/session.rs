//! Prover session: process spawn, command execution, and the
//! per-statement evaluation state machine.
//!
//! A session owns exactly one prover process and talks to it over a
//! single duplex stream, one command in flight at a time. All I/O is an
//! untimed wait on that process; a stalled prover blocks the caller until
//! the process is torn down externally. The only mutable session state is
//! the `tip` — the state id of the last committed statement — and it is
//! only moved by [`Session::eval`] and [`Session::roll_back_to`].

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::OnceLock;

use regex::Regex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, ChildStdin, ChildStdout};

use crate::codec::{CommandWriter, EnvelopeReader};
use crate::error::ProtocolError;
use crate::protocol::{Command, Reply, StateId, ValueReply};
use crate::render;

/// Detects the benign "end of input" anomaly the prover reports when an
/// effectively-empty trailing fragment is submitted.
///
/// The wording is version-specific, so the signatures are data rather
/// than hardcoded checks: an error matches when every substring of any
/// one signature occurs in it.
#[derive(Debug, Clone)]
pub struct AnomalyMatcher {
    signatures: Vec<Vec<String>>,
}

impl Default for AnomalyMatcher {
    fn default() -> Self {
        Self::new(vec![
            vec!["Anomaly".to_string(), "Stm.End_of_input".to_string()],
            // Older prover versions word the same condition differently.
            vec![
                "Anomaly".to_string(),
                "Invalid_argument(\"vernac_parse\")".to_string(),
            ],
        ])
    }
}

impl AnomalyMatcher {
    #[must_use]
    pub fn new(signatures: Vec<Vec<String>>) -> Self {
        Self { signatures }
    }

    #[must_use]
    pub fn matches(&self, error: &str) -> bool {
        self.signatures
            .iter()
            .any(|signature| signature.iter().all(|needle| error.contains(needle)))
    }
}

/// Options for [`Session::open`].
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Extra arguments appended to the prover command line.
    pub args: Vec<String>,
    /// End-of-input anomaly signatures; override when a prover version
    /// changes the wording.
    pub end_of_input: AnomalyMatcher,
}

/// Result of evaluating one block of proof-script text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalOutcome {
    pub success: bool,
    /// Text blocks in the chronological order their replies arrived.
    pub outputs: Vec<String>,
}

/// A live prover session.
pub struct Session<R = ChildStdout, W = ChildStdin> {
    reader: EnvelopeReader<R>,
    writer: CommandWriter<W>,
    tip: StateId,
    version: String,
    banner: String,
    end_of_input: AnomalyMatcher,
    /// Present for spawned sessions; killed on drop with the session.
    #[allow(dead_code)]
    child: Option<Child>,
}

impl Session {
    /// Locate, spawn and initialize a prover process.
    pub async fn open(options: SessionOptions) -> Result<Self, ProtocolError> {
        let prover = locate_prover().await?;
        tracing::info!(
            "starting {} {} ({})",
            prover.kind.binary_name(),
            prover.version,
            prover.path.display()
        );

        let mut command = tokio::process::Command::new(&prover.path);
        match prover.kind {
            ProverKind::CoqIdeTop => {
                command.args(["-main-channel", "stdfds"]);
            }
            ProverKind::CoqTop => {
                command.args(["-toploop", "coqidetop", "-main-channel", "stdfds"]);
            }
        }
        command
            .args(&options.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let spawn_error = |source: std::io::Error| ProtocolError::Spawn {
            command: prover.path.display().to_string(),
            source,
        };
        let mut child = command.spawn().map_err(spawn_error)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error(std::io::Error::other("child stdout was not captured")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error(std::io::Error::other("child stdin was not captured")))?;

        let mut reader = EnvelopeReader::new(stdout);
        let mut writer = CommandWriter::new(stdin);
        let (init, _) = execute_raw(&mut reader, &mut writer, &Command::Init, false).await?;
        let tip = init.initial_state_id().ok_or_else(|| {
            ProtocolError::Malformed("Init reply carried no state_id".to_string())
        })?;

        Ok(Self {
            reader,
            writer,
            tip,
            version: prover.version,
            banner: prover.banner,
            end_of_input: options.end_of_input,
            child: Some(child),
        })
    }
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> Session<R, W> {
    /// State id of the last committed statement.
    #[must_use]
    pub fn tip(&self) -> &StateId {
        &self.tip
    }

    /// Prover version number captured at startup.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Full `--version` banner captured at startup.
    #[must_use]
    pub fn banner(&self) -> &str {
        &self.banner
    }

    /// Evaluate a block of proof-script text.
    ///
    /// Statement rejections are data, reported through the outcome; an
    /// `Err` means the protocol itself broke. On a failed outcome the tip
    /// is exactly what it was at entry — statements that had individually
    /// succeeded are rolled back as a unit.
    pub async fn eval(&mut self, text: &str) -> Result<EvalOutcome, ProtocolError> {
        let tip_before = self.tip.clone();
        let mut pending = split_statements(text);

        let mut success = true;
        let mut outputs = Vec::new();
        let mut last_status: Option<ValueReply> = None;

        while let Some(statement) = pending.pop_front() {
            let tip = self.tip.clone();
            let (add, _) = self
                .execute(
                    &Command::Add {
                        sentence: &statement,
                        tip: &tip,
                    },
                    true,
                )
                .await?;
            let (status, status_replies) = self.execute(&Command::Status, true).await?;

            if !add.is_good() || !status.is_good() {
                // Even a rejected Add can move the prover's internal tip
                // (e.g. a statement the parser accepts but that fails
                // late). Re-affirm the current tip so nothing lingers.
                self.roll_back_to(&tip).await?;

                if let Some(next) = pending.pop_front() {
                    // The naive split most likely cut a '.' that was not
                    // a terminator; retry the merged statement.
                    let mut merged = statement;
                    merged.push_str(&next);
                    pending.push_front(merged);
                    continue;
                }

                let errors: Vec<String> = [&add, &status]
                    .into_iter()
                    .filter_map(|reply| reply.failure_payload().map(render::error_text))
                    .collect();
                let benign = add
                    .failure_payload()
                    .map(render::error_text)
                    .is_some_and(|error| self.end_of_input.matches(&error));
                last_status = Some(status);

                if benign {
                    // Evaluating an effectively-empty trailing fragment;
                    // ignore both the failure and its output.
                    break;
                }

                success = false;
                outputs.extend(errors);
                break;
            }

            self.tip = add.next_tip().ok_or_else(|| {
                ProtocolError::Malformed("good Add reply carried no state_id".to_string())
            })?;
            outputs.extend(
                status_replies
                    .iter()
                    .filter_map(|reply| reply.message().and_then(render::message_text)),
            );
            last_status = Some(status);
        }

        if success {
            if let Some(status) = &last_status {
                if let Some(name) = status.proof_name() {
                    outputs.push(format!("Proving: {name}"));
                }
                let (goal, _) = self.execute(&Command::Goal, false).await?;
                if let Some(set) = goal.goal_set() {
                    outputs.push(render::goals_text(&set));
                }
            }
        } else {
            self.roll_back_to(&tip_before).await?;
        }

        Ok(EvalOutcome { success, outputs })
    }

    /// Roll the prover back to `state_id` and make it the new tip.
    pub async fn roll_back_to(&mut self, state_id: &StateId) -> Result<(), ProtocolError> {
        self.execute(&Command::EditAt { state_id }, false).await?;
        self.tip = state_id.clone();
        Ok(())
    }

    /// Send one command and collect replies until its terminal `value`.
    async fn execute(
        &mut self,
        command: &Command<'_>,
        allow_fail: bool,
    ) -> Result<(ValueReply, Vec<Reply>), ProtocolError> {
        execute_raw(&mut self.reader, &mut self.writer, command, allow_fail).await
    }
}

#[cfg(test)]
impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> Session<R, W> {
    /// Session over scripted streams, bypassing process spawn.
    fn scripted(reader: R, writer: W, tip: StateId) -> Self {
        Self {
            reader: EnvelopeReader::new(reader),
            writer: CommandWriter::new(writer),
            tip,
            version: "8.20.0".to_string(),
            banner: String::new(),
            end_of_input: AnomalyMatcher::default(),
            child: None,
        }
    }
}

async fn execute_raw<R: AsyncRead + Unpin, W: AsyncWrite + Unpin>(
    reader: &mut EnvelopeReader<R>,
    writer: &mut CommandWriter<W>,
    command: &Command<'_>,
    allow_fail: bool,
) -> Result<(ValueReply, Vec<Reply>), ProtocolError> {
    writer.send(&command.wire()).await?;

    let mut out_of_band = Vec::new();
    loop {
        let envelope = reader.read_envelope().await?;
        match Reply::parse(&envelope)? {
            Reply::Value(value) => {
                if !allow_fail && !value.is_good() {
                    return Err(ProtocolError::UnexpectedFailure(envelope));
                }
                return Ok((value, out_of_band));
            }
            reply => out_of_band.push(reply),
        }
    }
}

/// Split text into `.`-terminated statements. The final unterminated
/// fragment is kept only when it contains more than whitespace.
fn split_statements(text: &str) -> VecDeque<String> {
    let mut pieces: Vec<&str> = text.split('.').collect();
    // split always yields at least one piece
    let leftover = pieces.pop().unwrap_or_default();

    let mut statements: VecDeque<String> =
        pieces.into_iter().map(|piece| format!("{piece}.")).collect();
    if !leftover.trim_matches([' ', '\t', '\n', '\r']).is_empty() {
        statements.push_back(leftover.to_string());
    }
    statements
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProverKind {
    CoqIdeTop,
    CoqTop,
}

impl ProverKind {
    fn binary_name(self) -> &'static str {
        match self {
            Self::CoqIdeTop => "coqidetop",
            Self::CoqTop => "coqtop",
        }
    }
}

struct ProverBinary {
    kind: ProverKind,
    path: PathBuf,
    version: String,
    banner: String,
}

/// Locate a usable prover binary and capture its version banner.
///
/// Prefers `coqidetop`; falls back to `coqtop`, which only carries the
/// ide toploop before 8.9.
async fn locate_prover() -> Result<ProverBinary, ProtocolError> {
    for kind in [ProverKind::CoqIdeTop, ProverKind::CoqTop] {
        let Ok(path) = which::which(kind.binary_name()) else {
            continue;
        };
        let Ok(output) = tokio::process::Command::new(&path)
            .arg("--version")
            .output()
            .await
        else {
            continue;
        };
        let banner = String::from_utf8_lossy(&output.stdout).into_owned();
        let version = banner_version(&banner)
            .ok_or_else(|| ProtocolError::UnrecognizedBanner(banner.clone()))?;

        if kind == ProverKind::CoqTop && version_at_least(&version, &[8, 9]) {
            return Err(ProtocolError::UnsupportedVersion { version });
        }
        return Ok(ProverBinary {
            kind,
            path,
            version,
            banner,
        });
    }
    Err(ProtocolError::BinaryNotFound)
}

fn banner_version(banner: &str) -> Option<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"version (\d+(\.\d+)+)").expect("version pattern is valid"));
    pattern
        .captures(banner)
        .map(|captures| captures[1].to_string())
}

/// Component-wise version comparison, shorter versions padded with zeros.
fn version_at_least(version: &str, minimum: &[u32]) -> bool {
    let parts: Vec<u32> = version
        .split('.')
        .map(|part| part.parse().unwrap_or(0))
        .collect();
    for i in 0..parts.len().max(minimum.len()) {
        let have = parts.get(i).copied().unwrap_or(0);
        let want = minimum.get(i).copied().unwrap_or(0);
        if have != want {
            return have > want;
        }
    }
    true
}
