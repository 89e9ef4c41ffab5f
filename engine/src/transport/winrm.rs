//! WinRM execution over WS-Management
//!
//! Each session owns one remote shell. Commands are sent to PowerShell as
//! `-EncodedCommand` payloads and their streams are collected with `Receive`
//! until the command reports `Done`.

use std::path::Path;
use std::sync::LazyLock;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use regex::Regex;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::FleetError;
use crate::models::{CommandOutput, Credential, Host};
use crate::transport::{Session, Transport, TransportOptions};

const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_RECEIVE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
const ACTION_SIGNAL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";
const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";

/// Fault code returned when a `Receive` outlives the operation timeout
const FAULT_OPERATION_TIMEOUT: &str = "2150858793";

static SHELL_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<(?:\w+:)?Selector Name="ShellId">([^<]+)</|<(?:\w+:)?ShellId>([^<]+)</"#)
        .expect("valid regex")
});
static COMMAND_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<(?:\w+:)?CommandId>([^<]+)</").expect("valid regex")
});
static STREAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<(?:\w+:)?Stream\b([^>]*[^/])>([^<]*)</(?:\w+:)?Stream>")
        .expect("valid regex")
});
static STREAM_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"Name="(\w+)""#).expect("valid regex")
});
static EXIT_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<(?:\w+:)?ExitCode>(-?\d+)</").expect("valid regex")
});
static FAULT_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<(?:\w+:)?(?:Message|Text)[^>]*>([^<]+)</")
        .expect("valid regex")
});

pub struct WinRmTransport {
    client: Client,
    options: TransportOptions,
}

impl WinRmTransport {
    pub fn new(options: TransportOptions) -> Result<Self, FleetError> {
        // hosts commonly present self-signed certificates on 5986
        let client = Client::builder()
            .connect_timeout(options.connect_timeout)
            .timeout(options.command_timeout)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self { client, options })
    }
}

#[async_trait]
impl Transport for WinRmTransport {
    async fn connect(
        &self,
        host: &Host,
        credential: &Credential,
    ) -> Result<Box<dyn Session>, FleetError> {
        let scheme = if credential.ssl { "https" } else { "http" };
        let endpoint = format!(
            "{scheme}://{}:{}/wsman",
            host.address,
            credential.port_or_default()
        );

        let mut session = WinRmSession {
            client: self.client.clone(),
            endpoint,
            username: credential.username.clone(),
            password: SecretString::from(credential.password.expose_secret().to_owned()),
            shell_id: String::new(),
            options: self.options.clone(),
        };
        session.shell_id = session.create_shell().await?;
        debug!("Opened winrm shell {} on {}", session.shell_id, host.address);
        Ok(Box::new(session))
    }
}

struct WinRmSession {
    client: Client,
    endpoint: String,
    username: String,
    password: SecretString,
    shell_id: String,
    options: TransportOptions,
}

impl WinRmSession {
    fn envelope(&self, action: &str, with_shell: bool, option_set: &str, body: &str) -> String {
        let selector = if with_shell {
            format!(
                r#"<w:SelectorSet><w:Selector Name="ShellId">{}</w:Selector></w:SelectorSet>"#,
                self.shell_id
            )
        } else {
            String::new()
        };
        format!(
            concat!(
                r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" "#,
                r#"xmlns:a="http://schemas.xmlsoap.org/ws/2004/08/addressing" "#,
                r#"xmlns:w="http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd" "#,
                r#"xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell">"#,
                "<s:Header>",
                "<a:To>{endpoint}</a:To>",
                r#"<a:ReplyTo><a:Address s:mustUnderstand="true">"#,
                "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous",
                "</a:Address></a:ReplyTo>",
                r#"<w:MaxEnvelopeSize s:mustUnderstand="true">153600</w:MaxEnvelopeSize>"#,
                "<a:MessageID>uuid:{message_id}</a:MessageID>",
                r#"<w:Locale xml:lang="en-US" s:mustUnderstand="false"/>"#,
                "<w:OperationTimeout>PT60S</w:OperationTimeout>",
                r#"<w:ResourceURI s:mustUnderstand="true">"#,
                "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd",
                "</w:ResourceURI>",
                r#"<a:Action s:mustUnderstand="true">{action}</a:Action>"#,
                "{selector}{option_set}",
                "</s:Header>",
                "<s:Body>{body}</s:Body>",
                "</s:Envelope>"
            ),
            endpoint = self.endpoint,
            message_id = Uuid::new_v4(),
            action = action,
            selector = selector,
            option_set = option_set,
            body = body,
        )
    }

    /// POST an envelope; returns the body of a successful response
    async fn send(&self, envelope: String) -> Result<String, FleetError> {
        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.username, Some(self.password.expose_secret()))
            .header("Content-Type", "application/soap+xml;charset=UTF-8")
            .body(envelope)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    FleetError::ConnectError(format!("{}: {e}", self.endpoint))
                } else {
                    FleetError::HttpError(e)
                }
            })?;

        let status = response.status();
        let body = response.text().await?;
        match status {
            s if s.is_success() => Ok(body),
            StatusCode::UNAUTHORIZED => Err(FleetError::AuthError(format!(
                "{}: credentials rejected",
                self.endpoint
            ))),
            s => Err(FleetError::TransportError(format!(
                "{}: {s}: {}",
                self.endpoint,
                fault_text(&body)
            ))),
        }
    }

    async fn create_shell(&self) -> Result<String, FleetError> {
        let options = concat!(
            "<w:OptionSet>",
            r#"<w:Option Name="WINRS_NOPROFILE">TRUE</w:Option>"#,
            r#"<w:Option Name="WINRS_CODEPAGE">65001</w:Option>"#,
            "</w:OptionSet>"
        );
        let body = concat!(
            "<rsp:Shell>",
            "<rsp:InputStreams>stdin</rsp:InputStreams>",
            "<rsp:OutputStreams>stdout stderr</rsp:OutputStreams>",
            "</rsp:Shell>"
        );
        let response = self
            .send(self.envelope(ACTION_CREATE, false, options, body))
            .await?;
        parse_shell_id(&response).ok_or_else(|| {
            FleetError::TransportError(format!("{}: no shell id in response", self.endpoint))
        })
    }

    async fn start_command(&self, script: &str) -> Result<String, FleetError> {
        let options = concat!(
            "<w:OptionSet>",
            r#"<w:Option Name="WINRS_CONSOLEMODE_STDIN">TRUE</w:Option>"#,
            r#"<w:Option Name="WINRS_SKIP_CMD_SHELL">FALSE</w:Option>"#,
            "</w:OptionSet>"
        );
        let body = format!(
            concat!(
                "<rsp:CommandLine>",
                "<rsp:Command>powershell</rsp:Command>",
                "<rsp:Arguments>-NoProfile -NonInteractive -EncodedCommand {}</rsp:Arguments>",
                "</rsp:CommandLine>"
            ),
            encode_powershell(script)
        );
        let response = self
            .send(self.envelope(ACTION_COMMAND, true, options, &body))
            .await?;
        parse_command_id(&response).ok_or_else(|| {
            FleetError::TransportError(format!("{}: no command id in response", self.endpoint))
        })
    }

    async fn receive(&self, command_id: &str) -> Result<CommandOutput, FleetError> {
        let body = format!(
            r#"<rsp:Receive><rsp:DesiredStream CommandId="{command_id}">stdout stderr</rsp:DesiredStream></rsp:Receive>"#
        );
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        loop {
            let response = match self
                .send(self.envelope(ACTION_RECEIVE, true, "", &body))
                .await
            {
                Ok(response) => response,
                Err(FleetError::TransportError(msg)) if msg.contains(FAULT_OPERATION_TIMEOUT) => {
                    continue;
                }
                Err(e) => return Err(e),
            };

            let chunk = parse_receive(&response)?;
            stdout.extend(chunk.stdout);
            stderr.extend(chunk.stderr);
            if chunk.done {
                return Ok(CommandOutput {
                    stdout: String::from_utf8_lossy(&stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                    exit_code: chunk.exit_code,
                });
            }
        }
    }

    async fn signal_terminate(&self, command_id: &str) -> Result<(), FleetError> {
        let body = format!(
            r#"<rsp:Signal CommandId="{command_id}"><rsp:Code>{SIGNAL_TERMINATE}</rsp:Code></rsp:Signal>"#
        );
        self.send(self.envelope(ACTION_SIGNAL, true, "", &body))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl Session for WinRmSession {
    async fn run_command(
        &mut self,
        command: &str,
        elevate: bool,
    ) -> Result<CommandOutput, FleetError> {
        if elevate {
            debug!("Elevation is not applied over winrm; running as {}", self.username);
        }
        let command_id = self.start_command(command).await?;
        let result = tokio::time::timeout(self.options.command_timeout, self.receive(&command_id))
            .await
            .map_err(|_| {
                FleetError::Timeout(format!(
                    "{}: command exceeded {:?}",
                    self.endpoint, self.options.command_timeout
                ))
            });

        if let Err(e) = self.signal_terminate(&command_id).await {
            warn!("Failed to terminate winrm command {}: {}", command_id, e);
        }
        result?
    }

    async fn send_file(&mut self, _local: &Path, _remote: &str) -> Result<(), FleetError> {
        Err(FleetError::TransportError(
            "winrm sessions do not transfer files, use smb".to_string(),
        ))
    }

    async fn close(&mut self) -> Result<(), FleetError> {
        self.send(self.envelope(ACTION_DELETE, true, "", ""))
            .await
            .map(|_| ())
    }
}

/// Base64 of the UTF-16LE script, as `powershell -EncodedCommand` expects
pub fn encode_powershell(script: &str) -> String {
    let bytes: Vec<u8> = script.encode_utf16().flat_map(u16::to_le_bytes).collect();
    BASE64.encode(bytes)
}

fn parse_shell_id(xml: &str) -> Option<String> {
    SHELL_ID.captures(xml).and_then(|c| {
        c.get(1)
            .or_else(|| c.get(2))
            .map(|m| m.as_str().trim().to_string())
    })
}

fn parse_command_id(xml: &str) -> Option<String> {
    COMMAND_ID
        .captures(xml)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

#[derive(Debug, Default)]
struct ReceiveChunk {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    done: bool,
    exit_code: Option<i32>,
}

fn parse_receive(xml: &str) -> Result<ReceiveChunk, FleetError> {
    let mut chunk = ReceiveChunk::default();
    for caps in STREAM.captures_iter(xml) {
        let attrs = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let content = caps.get(2).map(|m| m.as_str().trim()).unwrap_or_default();
        if content.is_empty() {
            continue;
        }
        let decoded = BASE64
            .decode(content)
            .map_err(|e| FleetError::TransportError(format!("bad stream encoding: {e}")))?;
        match STREAM_NAME.captures(attrs).and_then(|c| c.get(1)).map(|m| m.as_str()) {
            Some("stderr") => chunk.stderr.extend(decoded),
            _ => chunk.stdout.extend(decoded),
        }
    }
    chunk.done = xml.contains("CommandState/Done");
    chunk.exit_code = EXIT_CODE
        .captures(xml)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok());
    Ok(chunk)
}

fn fault_text(xml: &str) -> String {
    let texts: Vec<&str> = FAULT_TEXT
        .captures_iter(xml)
        .filter_map(|c| c.get(1).map(|m| m.as_str().trim()))
        .collect();
    if texts.is_empty() {
        let snippet: String = xml.chars().take(200).collect();
        return snippet;
    }
    let code = if xml.contains(FAULT_OPERATION_TIMEOUT) {
        format!(" ({FAULT_OPERATION_TIMEOUT})")
    } else {
        String::new()
    };
    format!("{}{}", texts.join("; "), code)
}
