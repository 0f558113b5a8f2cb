//! One-command-per-controller batching.
//!
//! A group operation over axes spread across several controllers becomes one
//! `VERB addr1 [value1] addr2 [value2] ...` line per controller. Replies are
//! split on whitespace and assigned back to the axes in the order their
//! addresses were appended.

use crate::axis::AxisNode;
use crate::controller::Controller;
use crate::error::{IcepapError, Result};
use crate::group::AxisMap;
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::debug;

/// How the value attached to each axis is rendered on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    /// Addresses only.
    None,
    /// Integer step positions.
    Position,
    /// Integer velocities in steps/s.
    Velocity,
    /// Acceleration times in seconds, six decimals.
    AccelTime,
}

/// Axes and optional per-axis values of one batched operation.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    /// Value rendering.
    pub kind: BatchKind,
    /// Target axes with their value (ignored for [`BatchKind::None`]).
    pub values: AxisMap<f64>,
}

impl BatchRequest {
    /// Address-only request over `axes`.
    pub fn plain(axes: &[Arc<AxisNode>]) -> Self {
        Self {
            kind: BatchKind::None,
            values: axes.iter().map(|a| (Arc::clone(a), 0.0)).collect(),
        }
    }

    /// Value-bearing request.
    pub fn with_values(kind: BatchKind, values: AxisMap<f64>) -> Self {
        Self { kind, values }
    }

    fn render(&self, axis: &AxisNode, value: f64) -> Result<Option<String>> {
        match self.kind {
            BatchKind::None => Ok(None),
            BatchKind::Position | BatchKind::Velocity => {
                if !value.is_finite() || value < i64::MIN as f64 || value > i64::MAX as f64 {
                    return Err(IcepapError::InvalidOption(format!(
                        "value {} for axis \"{}\" is not an integer",
                        value,
                        axis.name()
                    )));
                }
                Ok(Some(format!("{}", value.trunc() as i64)))
            }
            BatchKind::AccelTime => {
                if !value.is_finite() {
                    return Err(IcepapError::InvalidOption(format!(
                        "acceleration time {} for axis \"{}\" is not finite",
                        value,
                        axis.name()
                    )));
                }
                Ok(Some(format!("{:.6}", value)))
            }
        }
    }

    /// Build one command per controller, in first-appearance order.
    ///
    /// Every value is rendered before anything is returned, so a bad value
    /// fails the whole request without a partial send.
    pub fn build(&self, verb: &str) -> Result<Vec<ControllerCommand>> {
        let verb = verb.trim().to_uppercase();
        let mut commands: Vec<ControllerCommand> = Vec::new();
        for (axis, value) in self.values.iter() {
            let rendered = self.render(axis, *value)?;
            let slot = match commands
                .iter()
                .position(|c| Arc::ptr_eq(&c.controller, axis.controller()))
            {
                Some(index) => index,
                None => {
                    commands.push(ControllerCommand {
                        controller: Arc::clone(axis.controller()),
                        axes: Vec::new(),
                        text: verb.clone(),
                    });
                    commands.len() - 1
                }
            };
            let command = &mut commands[slot];
            command.text.push_str(&format!(" {}", axis.address()));
            if let Some(rendered) = rendered {
                command.text.push(' ');
                command.text.push_str(&rendered);
            }
            command.axes.push(Arc::clone(axis));
        }
        Ok(commands)
    }
}

/// One batched line for one controller.
#[derive(Debug, Clone)]
pub struct ControllerCommand {
    /// Target controller.
    pub controller: Arc<Controller>,
    /// Axes in the order their addresses appear in `text`.
    pub axes: Vec<Arc<AxisNode>>,
    /// Command line.
    pub text: String,
}

impl ControllerCommand {
    /// Send acknowledged and return the ASCII answer.
    pub async fn ack(&self) -> Result<String> {
        debug!(host = self.controller.host(), command = %self.text, "batched command");
        self.controller.ack_text(&self.text).await
    }

    /// Send without acknowledgement.
    pub async fn send(&self) -> Result<()> {
        debug!(host = self.controller.host(), command = %self.text, "batched command");
        self.controller.command(&self.text, None).await?;
        Ok(())
    }

    /// Send acknowledged and split the answer into one token per axis.
    pub async fn ack_tokens(&self) -> Result<Vec<(Arc<AxisNode>, String)>> {
        let answer = self.ack().await?;
        let tokens: Vec<&str> = answer.split_whitespace().collect();
        if tokens.len() != self.axes.len() {
            return Err(IcepapError::protocol(
                self.controller.host(),
                &self.text,
                format!("expected {} values, got \"{}\"", self.axes.len(), answer),
            ));
        }
        Ok(self
            .axes
            .iter()
            .cloned()
            .zip(tokens.into_iter().map(str::to_string))
            .collect())
    }
}

/// Fan a query out to every controller and reassemble the per-axis tokens in
/// the order of `request`.
pub async fn query_tokens(request: &BatchRequest, verb: &str) -> Result<AxisMap<String>> {
    let commands = request.build(verb)?;
    let replies = try_join_all(commands.iter().map(|c| c.ack_tokens())).await?;
    let mut tokens: AxisMap<String> = replies.into_iter().flatten().collect();
    tokens.reorder(&request.values.axes());
    Ok(tokens)
}

/// Fan an acknowledged write out to every controller and return each
/// controller's answer.
pub async fn ack_all(request: &BatchRequest, verb: &str) -> Result<Vec<(Arc<Controller>, String)>> {
    let commands = request.build(verb)?;
    try_join_all(commands.iter().map(|c| async move {
        let answer = c.ack().await?;
        Ok::<_, IcepapError>((Arc::clone(&c.controller), answer))
    }))
    .await
}

/// Fan an unacknowledged write out to every controller.
pub async fn send_all(request: &BatchRequest, verb: &str) -> Result<()> {
    let commands = request.build(verb)?;
    try_join_all(commands.iter().map(|c| c.send())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::AxisFlags;
    use crate::controller::offline;

    fn axes() -> Vec<Arc<AxisNode>> {
        let a = offline("iceA");
        let b = offline("iceB");
        vec![
            Arc::new(AxisNode::new(Arc::clone(&a), 1, Some("a1"), AxisFlags::default()).unwrap()),
            Arc::new(AxisNode::new(Arc::clone(&b), 5, Some("b1"), AxisFlags::default()).unwrap()),
            Arc::new(AxisNode::new(a, 2, Some("a2"), AxisFlags::default()).unwrap()),
        ]
    }

    #[tokio::test]
    async fn answer_must_have_one_token_per_axis() {
        use crate::protocol::{CommandProtocol, ProtocolSettings};
        use crate::transport::TransportChannel;
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        let (device, host_side) = tokio::io::duplex(1024);
        let channel = TransportChannel::from_stream("ice1", host_side);
        let controller = Arc::new(Controller::from_protocol(
            "ice1",
            CommandProtocol::new(channel, ProtocolSettings::default()),
        ));
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(device);
            let mut lines = BufReader::new(read).lines();
            for reply in ["?FPOS 10 20\n", "?FPOS 10 20 30\n"] {
                if lines.next_line().await.ok().flatten().is_none() {
                    break;
                }
                write.write_all(reply.as_bytes()).await.unwrap();
            }
        });
        let pair = vec![
            Arc::new(AxisNode::new(Arc::clone(&controller), 1, Some("m1"), AxisFlags::default()).unwrap()),
            Arc::new(AxisNode::new(controller, 2, Some("m2"), AxisFlags::default()).unwrap()),
        ];
        let commands = BatchRequest::plain(&pair).build("?FPOS").unwrap();

        let tokens = commands[0].ack_tokens().await.unwrap();
        assert_eq!(tokens[1].1, "20");
        let err = commands[0].ack_tokens().await.unwrap_err();
        assert!(matches!(err, IcepapError::Protocol { .. }), "{err}");
    }

    #[tokio::test]
    async fn one_command_per_controller() {
        let axes = axes();
        let commands = BatchRequest::plain(&axes).build("?fstatus").unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].text, "?FSTATUS 1 2");
        assert_eq!(commands[1].text, "?FSTATUS 5");
        let names: Vec<_> = commands[0].axes.iter().map(|a| a.name()).collect();
        assert_eq!(names, vec!["a1", "a2"]);
    }

    #[tokio::test]
    async fn value_rendering() {
        let axes = axes();
        let values: AxisMap<f64> = axes.iter().cloned().zip([100.9, -3.0, 7.0]).collect();
        let commands = BatchRequest::with_values(BatchKind::Position, values.clone())
            .build("MOVE GROUP")
            .unwrap();
        assert_eq!(commands[0].text, "MOVE GROUP 1 100 2 7");
        assert_eq!(commands[1].text, "MOVE GROUP 5 -3");

        let commands = BatchRequest::with_values(BatchKind::AccelTime, values).build("ACCTIME").unwrap();
        assert_eq!(commands[0].text, "ACCTIME 1 100.900000 2 7.000000");
    }

    #[tokio::test]
    async fn bad_position_fails_whole_request() {
        let axes = axes();
        let values: AxisMap<f64> = axes.iter().cloned().zip([1.0, f64::NAN, 2.0]).collect();
        let err = BatchRequest::with_values(BatchKind::Position, values)
            .build("MOVE GROUP")
            .unwrap_err();
        assert!(err.to_string().contains("b1"));
    }
}
