//! Negotiation through an external `natpmpc` compatible client

use async_trait::async_trait;

use super::{parse_response, MappingRequest, Negotiation, Negotiator};
use crate::error::{MapperError, MapperResult};
use crate::process::{run_with_timeout, split_command, CommandOutcome};

/// Runs `<exec_path> -a <public> <private> <proto> <lifetime> -g <gateway>`
#[derive(Debug, Default, Clone)]
pub struct CommandNegotiator;

impl CommandNegotiator {
    pub fn new() -> Self {
        Self
    }

    /// Program and full argument list for `request`
    pub fn command_line(request: &MappingRequest) -> MapperResult<(String, Vec<String>)> {
        let (program, extra) = split_command(&request.exec_path).ok_or_else(|| {
            MapperError::InvalidRequest("negotiation command is empty".to_string())
        })?;
        if request.gateway.is_empty() {
            return Err(MapperError::InvalidRequest(
                "gateway address is required for the command backend".to_string(),
            ));
        }

        let mut args: Vec<String> = extra.into_iter().map(str::to_string).collect();
        args.extend([
            "-a".to_string(),
            request.public_port.to_string(),
            request.private_port.to_string(),
            request.protocol.as_arg().to_string(),
            request.lifetime.to_string(),
            "-g".to_string(),
            request.gateway.clone(),
        ]);

        Ok((program.to_string(), args))
    }
}

#[async_trait]
impl Negotiator for CommandNegotiator {
    async fn negotiate(&self, request: &MappingRequest) -> MapperResult<Negotiation> {
        let (program, args) = Self::command_line(request)?;

        let outcome = run_with_timeout(&program, &args, request.timeout)
            .await
            .map_err(|source| MapperError::Spawn {
                program: program.clone(),
                source,
            })?;

        match outcome {
            CommandOutcome::Exited { status, output } if status.success() => Ok(Negotiation {
                result: parse_response(&output),
                output,
            }),
            CommandOutcome::Exited { status, output } => Err(MapperError::NegotiationFailed {
                protocol: request.protocol,
                code: status.code(),
                output,
            }),
            CommandOutcome::TimedOut { output } => Err(MapperError::NegotiationTimeout {
                protocol: request.protocol,
                timeout: request.timeout.unwrap_or_default(),
                output,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Backend, Config};
    use crate::mapper::Protocol;
    use std::time::Duration;

    fn request(exec_path: &str, protocol: Protocol) -> MappingRequest {
        let config = Config {
            exec_path: exec_path.to_string(),
            preferred_public_port: 51413,
            preferred_private_port: 51413,
            backend: Backend::Command,
            ..Config::default()
        };
        MappingRequest::from_config(&config, protocol)
    }

    #[test]
    fn test_command_line() {
        let (program, args) =
            CommandNegotiator::command_line(&request("natpmpc -v", Protocol::Udp)).unwrap();

        assert_eq!(program, "natpmpc");
        assert_eq!(
            args,
            vec!["-v", "-a", "51413", "51413", "udp", "60", "-g", "10.2.0.1"]
        );
    }

    #[test]
    fn test_empty_command_is_rejected() {
        let result = CommandNegotiator::command_line(&request("  ", Protocol::Tcp));
        assert!(matches!(result, Err(MapperError::InvalidRequest(_))));
    }

    #[cfg(unix)]
    mod fake_helper {
        use super::*;
        use std::path::PathBuf;
        use tempfile::TempDir;

        /// Shell script standing in for natpmpc; echoes the requested mapping
        fn write_helper(body: &str) -> (TempDir, PathBuf) {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("natpmpc.sh");
            std::fs::write(&path, body).unwrap();
            (dir, path)
        }

        const ECHO_HELPER: &str = r#"
# args: -a public private proto lifetime -g gateway
echo "using gateway : $7"
echo "Public IP address : 203.0.113.9"
proto=$(echo "$4" | tr a-z A-Z)
echo "Mapped public port $2 protocol $proto to local port $3 lifetime $5"
"#;

        #[tokio::test]
        async fn test_successful_negotiation() {
            let (_dir, helper) = write_helper(ECHO_HELPER);
            let exec = format!("sh {}", helper.display());

            let negotiation = CommandNegotiator::new()
                .negotiate(&request(&exec, Protocol::Tcp))
                .await
                .unwrap();

            let result = negotiation.result;
            assert_eq!(result.gateway, Some("10.2.0.1".parse().unwrap()));
            assert_eq!(result.public_ip, Some("203.0.113.9".parse().unwrap()));
            assert_eq!(result.granted(), Some((Protocol::Tcp, 51413)));
            assert!(negotiation.output.contains("Mapped public port"));
        }

        #[tokio::test]
        async fn test_non_zero_exit_carries_output() {
            let (_dir, helper) = write_helper("echo 'sendnewportmappingrequest returned -7'\nexit 1\n");
            let exec = format!("sh {}", helper.display());

            let err = CommandNegotiator::new()
                .negotiate(&request(&exec, Protocol::Udp))
                .await
                .unwrap_err();

            match err {
                MapperError::NegotiationFailed { protocol, code, output } => {
                    assert_eq!(protocol, Protocol::Udp);
                    assert_eq!(code, Some(1));
                    assert!(output.contains("returned -7"));
                }
                other => panic!("unexpected error: {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_timeout() {
            // `sleep` runs as a child of the shell, not in its place
            let (_dir, helper) = write_helper("echo 'initnatpmp() returned 0'\nsleep 6\necho late\n");
            let exec = format!("sh {}", helper.display());
            let mut request = request(&exec, Protocol::Udp);
            request.timeout = Some(Duration::from_millis(300));

            let begun = std::time::Instant::now();
            let err = CommandNegotiator::new().negotiate(&request).await.unwrap_err();
            assert!(begun.elapsed() < Duration::from_secs(3), "took {:?}", begun.elapsed());

            match err {
                MapperError::NegotiationTimeout { output, .. } => {
                    assert!(output.contains("initnatpmp"))
                }
                other => panic!("unexpected error: {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_garbage_output_is_not_an_error() {
            let (_dir, helper) = write_helper("echo 'nothing useful here'\n");
            let exec = format!("sh {}", helper.display());

            let negotiation = CommandNegotiator::new()
                .negotiate(&request(&exec, Protocol::Udp))
                .await
                .unwrap();
            assert_eq!(negotiation.result.granted(), None);
        }
    }

    #[tokio::test]
    async fn test_missing_helper() {
        let err = CommandNegotiator::new()
            .negotiate(&request("no-such-binary-natpmpd-test", Protocol::Udp))
            .await
            .unwrap_err();
        assert!(matches!(err, MapperError::Spawn { .. }));
    }
}
