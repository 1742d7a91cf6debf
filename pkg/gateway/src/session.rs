//! The pieces of an interactive session that don't depend on the SSH
//! protocol engine.

use anyhow::{Result, bail};
use async_trait::async_trait;
use pkg_container::ContainerExecutor;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// The only login name accepted from SSH clients. The container user is
/// chosen with the `login_username` request parameter instead.
pub const SSH_USER: &str = "_";

/// Command used for a `shell` request or an empty `exec`.
pub const DEFAULT_COMMAND: &[&str] = &["/bin/bash", "-login"];

/// A bidirectional byte stream handed over after the HTTP upgrade.
pub trait GatewayStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> GatewayStream for T {}

/// Everything an SSH engine needs to serve one upgraded connection.
#[derive(Clone)]
pub struct SessionContext {
    pub container_uuid: String,
    pub detach_keys: String,
    pub username: String,
    pub target: Arc<dyn ContainerExecutor>,
}

/// SSH protocol engine. It speaks SSH over the upgraded stream and
/// dispatches each session channel with [`run_session`].
#[async_trait]
pub trait SessionHandler: Send + Sync {
    async fn serve(&self, stream: Box<dyn GatewayStream>, ctx: SessionContext) -> Result<()>;
}

/// Reject any SSH login name other than [`SSH_USER`].
pub fn validate_user(user: &str) -> Result<()> {
    if user != SSH_USER {
        bail!("cannot specify user {:?} via ssh client", user);
    }
    Ok(())
}

/// Split an `exec` request's command line with shell quoting rules.
pub fn parse_command(command: &str) -> Result<Vec<String>> {
    let Some(args) = shlex::split(command) else {
        bail!("error parsing supplied command: unbalanced quotes in {:?}", command);
    };
    if args.is_empty() {
        return Ok(DEFAULT_COMMAND.iter().map(|s| s.to_string()).collect());
    }
    Ok(args)
}

/// Run `command` inside the container with the given stdio, returning the
/// exit status to report to the client. Failures are explained on
/// `stderr` and reported as status 1.
pub async fn run_session<I, O, E>(
    ctx: &SessionContext,
    tty: bool,
    command: &str,
    stdin: I,
    stdout: O,
    mut stderr: E,
) -> u32
where
    I: AsyncRead + Send + Unpin + 'static,
    O: AsyncWrite + Send + Unpin + 'static,
    E: AsyncWrite + Send + Unpin + 'static,
{
    let args = match parse_command(command) {
        Ok(args) => args,
        Err(e) => {
            let _ = stderr.write_all(format!("{}\n", e).as_bytes()).await;
            return 1;
        }
    };
    tracing::info!(
        "[gateway] {} session as {:?}: {:?}",
        ctx.container_uuid,
        ctx.username,
        args
    );
    match spawn_and_wait(ctx, tty, &args, stdin, stdout, &mut stderr).await {
        Ok(status) => status,
        Err(e) => {
            let _ = stderr.write_all(format!("{}\n", e).as_bytes()).await;
            1
        }
    }
}

async fn spawn_and_wait<I, O, E>(
    ctx: &SessionContext,
    tty: bool,
    args: &[String],
    mut stdin: I,
    mut stdout: O,
    stderr: &mut E,
) -> Result<u32>
where
    I: AsyncRead + Send + Unpin + 'static,
    O: AsyncWrite + Send + Unpin + 'static,
    E: AsyncWrite + Send + Unpin,
{
    let mut cmd = ctx
        .target
        .inject_command(&ctx.detach_keys, &ctx.username, tty, args)
        .await?;
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd.spawn()?;

    // Not joined: the client may never close its end.
    if let Some(mut child_in) = child.stdin.take() {
        tokio::spawn(async move {
            let _ = tokio::io::copy(&mut stdin, &mut child_in).await;
            let _ = child_in.shutdown().await;
        });
    }
    let out_task = child.stdout.take().map(|mut child_out| {
        tokio::spawn(async move {
            let _ = tokio::io::copy(&mut child_out, &mut stdout).await;
            let _ = stdout.shutdown().await;
        })
    });
    if let Some(mut child_err) = child.stderr.take() {
        tokio::io::copy(&mut child_err, stderr).await?;
    }
    let status = child.wait().await?;
    if let Some(task) = out_task {
        let _ = task.await;
    }
    Ok(status.code().map(|c| c as u32).unwrap_or(1))
}
