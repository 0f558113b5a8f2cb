//! Single addressable motor channel and its status word.

use crate::controller::Controller;
use crate::error::{IcepapError, Result};
use crate::protocol::{BinaryBlock, Reply};
use parking_lot::RwLock;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::instrument;

/// Process-unique axis identifier.
pub type AxisId = u64;

static NEXT_AXIS_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Status word
// =============================================================================

const BIT_READY: u32 = 9;
const BIT_MOVING: u32 = 10;
const BIT_SETTLING: u32 = 11;
const BIT_OUTOFWIN: u32 = 12;
const BIT_WARNING: u32 = 13;
const BIT_HIGH_LIMIT: u32 = 18;
const BIT_LOW_LIMIT: u32 = 19;
const BIT_HOME: u32 = 20;
const BIT_POWER_ON: u32 = 23;

const MODE_CODES: [(&str, &str); 4] = [
    ("OPER", "operation mode"),
    ("PROG", "programmation mode"),
    ("TEST", "test mode"),
    ("FAIL", "fail mode"),
];

const DISABLE_CODES: [(&str, &str); 8] = [
    ("POWERENA", "power enabled"),
    ("NOTACTIVE", "axis configured as not active"),
    ("ALARM", "alarm condition"),
    ("REMRACKDIS", "remote rack disable input signal"),
    ("LOCRACKDIS", "local rack disable switch"),
    ("REMAXISDIS", "remote axis disable input signal"),
    ("LOCAXISDIS", "local axis disable switch"),
    ("SOFTDIS", "software disable"),
];

const STOP_CODES: [(&str, &str); 16] = [
    ("SCEOM", "end of movement"),
    ("SCSTOP", "last motion was stopped"),
    ("SCABORT", "last motion was aborted"),
    ("SCLIMPOS", "positive limitswitch reached"),
    ("SCLINNEG", "negative limitswitch reached"),
    ("SCSETTLINGTO", "settling timeout"),
    ("SCAXISDIS", "axis disabled (no alarm)"),
    ("SCBIT7", "n/a"),
    ("SCINTFAIL", "internal failure"),
    ("SCMOTFAIL", "motor failure"),
    ("SCPOWEROVL", "power overload"),
    ("SCHEATOVL", "driver overheating"),
    ("SCCLERROR", "closed loop error"),
    ("SCCENCERROR", "control encoder error"),
    ("SCBIT14", "n/a"),
    ("SCEXTALARM", "external alarm"),
];

/// Decoded value of a coded status field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCode {
    /// Raw field value.
    pub code: u8,
    /// Short firmware name.
    pub name: &'static str,
    /// Human-readable description.
    pub description: &'static str,
}

impl StatusCode {
    fn lookup(table: &[(&'static str, &'static str)], code: u32) -> Option<Self> {
        if code == 0 {
            return None;
        }
        table.get(code as usize).map(|&(name, description)| StatusCode {
            code: code as u8,
            name,
            description,
        })
    }
}

/// Axis status word as returned by `?FSTATUS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct AxisStatus(pub u32);

impl AxisStatus {
    /// Raw word.
    pub fn bits(self) -> u32 {
        self.0
    }

    fn bit(self, n: u32) -> bool {
        self.0 & (1 << n) != 0
    }

    /// Return a copy with bit `n` set to `value`.
    fn with_bit(self, n: u32, value: bool) -> Self {
        if value {
            AxisStatus(self.0 | (1 << n))
        } else {
            AxisStatus(self.0 & !(1 << n))
        }
    }

    /// Whether the axis reports motion in progress.
    ///
    /// MOVING drops at the end of the trajectory and SETTLING at the end of
    /// the closed loop. During homing both may drop between motions while READY
    /// stays low; POWERON discriminates that from a fault, which also clears READY.
    pub fn is_moving(self) -> bool {
        self.bit(BIT_MOVING) || self.bit(BIT_SETTLING) || (!self.bit(BIT_READY) && self.bit(BIT_POWER_ON))
    }

    /// READY bit.
    pub fn is_ready(self) -> bool {
        self.bit(BIT_READY)
    }

    /// MOVING bit only.
    pub fn moving_bit(self) -> bool {
        self.bit(BIT_MOVING)
    }

    /// SETTLING bit.
    pub fn is_settling(self) -> bool {
        self.bit(BIT_SETTLING)
    }

    /// OUTOFWIN bit.
    pub fn is_out_of_window(self) -> bool {
        self.bit(BIT_OUTOFWIN)
    }

    /// WARNING bit.
    pub fn has_warning(self) -> bool {
        self.bit(BIT_WARNING)
    }

    /// High limit switch active.
    pub fn high_limit(self) -> bool {
        self.bit(BIT_HIGH_LIMIT)
    }

    /// Low limit switch active.
    pub fn low_limit(self) -> bool {
        self.bit(BIT_LOW_LIMIT)
    }

    /// Home switch active.
    pub fn home(self) -> bool {
        self.bit(BIT_HOME)
    }

    /// POWERON bit.
    pub fn is_power_on(self) -> bool {
        self.bit(BIT_POWER_ON)
    }

    /// Operating mode (bits 2-3); `None` in normal operation.
    pub fn mode(self) -> Option<StatusCode> {
        StatusCode::lookup(&MODE_CODES, (self.0 >> 2) & 0x3)
    }

    /// Disable condition (bits 4-6); `None` when enabled.
    pub fn disable(self) -> Option<StatusCode> {
        StatusCode::lookup(&DISABLE_CODES, (self.0 >> 4) & 0x7)
    }

    /// Last motion stop code (bits 14-17); `None` after a normal end of movement.
    pub fn stop_code(self) -> Option<StatusCode> {
        StatusCode::lookup(&STOP_CODES, (self.0 >> 14) & 0xf)
    }

    /// Copy with the MOVING bit forced.
    pub fn with_moving(self, value: bool) -> Self {
        self.with_bit(BIT_MOVING, value)
    }

    /// Copy with the READY bit forced.
    pub fn with_ready(self, value: bool) -> Self {
        self.with_bit(BIT_READY, value)
    }

    /// Parse a hexadecimal word, with or without `0x`.
    pub fn parse_hex(text: &str) -> Option<Self> {
        let digits = text
            .trim()
            .trim_start_matches("0x")
            .trim_start_matches("0X");
        u32::from_str_radix(digits, 16).ok().map(AxisStatus)
    }
}

impl fmt::Display for AxisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

// =============================================================================
// Flags
// =============================================================================

/// Access flags of an axis or group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AxisFlags {
    /// Axis may belong to at most one group.
    pub exclusive: bool,
    /// Motion commands are refused.
    pub dontmove: bool,
    /// Every write is refused.
    pub readonly: bool,
}

impl AxisFlags {
    /// Parse space-separated `key=value` options, e.g. `"mode=dontmove"`.
    ///
    /// Options accumulate: `"mode=dontmove mode=readonly"` sets both.
    pub fn parse(options: &str) -> Result<Self> {
        let mut flags = AxisFlags::default();
        for token in options.split_whitespace() {
            let lower = token.to_lowercase();
            let Some((key, value)) = lower.split_once('=') else {
                return Err(IcepapError::InvalidOption(format!("\"{}\"", token)));
            };
            if !key.starts_with("mode") {
                return Err(IcepapError::InvalidOption(format!("unknown option \"{}\"", token)));
            }
            match value {
                "exclusive" => flags.exclusive = true,
                "dontmove" => flags.dontmove = true,
                "readonly" => flags.readonly = true,
                _ => return Err(IcepapError::InvalidOption(format!("unknown mode \"{}\"", token))),
            }
        }
        Ok(flags)
    }

    /// Flags set in either operand.
    pub fn union(self, other: AxisFlags) -> AxisFlags {
        AxisFlags {
            exclusive: self.exclusive || other.exclusive,
            dontmove: self.dontmove || other.dontmove,
            readonly: self.readonly || other.readonly,
        }
    }

    /// Refuse a write to `axis` when `readonly` is set.
    pub fn check_write(self, axis: &AxisNode, operation: &str) -> Result<()> {
        if self.readonly {
            return Err(IcepapError::AxisProtected {
                host: axis.host().to_string(),
                axis: axis.name().to_string(),
                flag: "readonly",
                operation: operation.to_string(),
            });
        }
        Ok(())
    }

    /// Refuse a motion when `readonly` or `dontmove` is set.
    pub fn check_motion(self, axis: &AxisNode, operation: &str) -> Result<()> {
        self.check_write(axis, operation)?;
        if self.dontmove {
            return Err(IcepapError::AxisProtected {
                host: axis.host().to_string(),
                axis: axis.name().to_string(),
                flag: "dontmove",
                operation: operation.to_string(),
            });
        }
        Ok(())
    }
}

impl FromStr for AxisFlags {
    type Err = IcepapError;

    fn from_str(s: &str) -> Result<Self> {
        AxisFlags::parse(s)
    }
}

impl fmt::Display for AxisFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (self.exclusive, "mode=exclusive"),
            (self.dontmove, "mode=dontmove"),
            (self.readonly, "mode=readonly"),
        ]
        .into_iter()
        .filter_map(|(set, name)| set.then_some(name))
        .collect();
        write!(f, "{}", names.join(" "))
    }
}

// =============================================================================
// AxisNode
// =============================================================================

/// One motor channel on a controller.
///
/// Group memberships live in the [`Registry`](crate::registry::Registry)
/// membership relation. The registry mirrors the combined flags of the
/// groups an axis belongs to onto the axis, so every write path sees them.
#[derive(Debug)]
pub struct AxisNode {
    id: AxisId,
    name: String,
    address: u16,
    controller: Arc<Controller>,
    flags: AxisFlags,
    group_flags: RwLock<AxisFlags>,
}

impl AxisNode {
    /// Create an axis at `address` on `controller`.
    ///
    /// Without a name the axis is called `<host>:<address>`. `exclusive` is a
    /// group property and is rejected here.
    pub fn new(controller: Arc<Controller>, address: u16, name: Option<&str>, flags: AxisFlags) -> Result<Self> {
        if flags.exclusive {
            return Err(IcepapError::InvalidOption(
                "\"mode=exclusive\" is only valid on groups".to_string(),
            ));
        }
        let name = match name {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("{}:{}", controller.host(), address),
        };
        Ok(Self {
            id: NEXT_AXIS_ID.fetch_add(1, Ordering::Relaxed),
            name,
            address,
            controller,
            flags,
            group_flags: RwLock::new(AxisFlags::default()),
        })
    }

    /// Identifier used by the membership relation.
    pub fn id(&self) -> AxisId {
        self.id
    }

    /// Axis name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address on the controller.
    pub fn address(&self) -> u16 {
        self.address
    }

    /// Owning controller.
    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    /// Controller hostname.
    pub fn host(&self) -> &str {
        self.controller.host()
    }

    /// Flags given at construction.
    pub fn flags(&self) -> AxisFlags {
        self.flags
    }

    /// Own flags OR the flags of every group the axis belongs to.
    pub fn effective_flags(&self) -> AxisFlags {
        self.flags.union(*self.group_flags.read())
    }

    pub(crate) fn set_group_flags(&self, flags: AxisFlags) {
        *self.group_flags.write() = flags;
    }

    /// Identification text.
    pub fn info(&self) -> String {
        format!(
            "axis: \"{}\" system: \"{}\" address: \"{}\"",
            self.name,
            self.host(),
            self.address
        )
    }

    /// Send a driver command prefixed with this axis' address.
    ///
    /// A leading `#` turns it into [`ackcommand`](Self::ackcommand).
    pub async fn command(&self, text: &str, payload: Option<&BinaryBlock>) -> Result<Reply> {
        let text = text.trim();
        if text.starts_with('#') {
            return self.ackcommand(text, payload).await;
        }
        self.controller
            .command(&format!("{}:{}", self.address, text), payload)
            .await
    }

    /// Send an acknowledged driver command prefixed with this axis' address.
    pub async fn ackcommand(&self, text: &str, payload: Option<&BinaryBlock>) -> Result<Reply> {
        let text = text.trim().trim_start_matches('#');
        self.controller
            .ackcommand(&format!("{}:{}", self.address, text), payload)
            .await
    }

    async fn ack_text(&self, text: &str) -> Result<String> {
        Ok(self.ackcommand(text, None).await?.into_text())
    }

    /// Status word.
    #[instrument(skip(self), fields(axis = %self.name), err)]
    pub async fn status(&self) -> Result<AxisStatus> {
        let command = format!("?FSTATUS {}", self.address);
        let answer = self.controller.ack_text(&command).await?;
        AxisStatus::parse_hex(&answer).ok_or_else(|| {
            IcepapError::protocol(self.host(), &command, format!("bad status word \"{}\"", answer))
        })
    }

    /// Current position in steps.
    #[instrument(skip(self), fields(axis = %self.name), err)]
    pub async fn pos(&self) -> Result<i64> {
        let command = format!("?FPOS {}", self.address);
        let answer = self.controller.ack_text(&command).await?;
        parse_steps(&answer).ok_or_else(|| {
            IcepapError::protocol(self.host(), &command, format!("bad position \"{}\"", answer))
        })
    }

    /// Start an absolute move to `position` steps.
    #[instrument(skip(self), fields(axis = %self.name), err)]
    pub async fn move_to(&self, position: i64) -> Result<()> {
        self.effective_flags().check_motion(self, "move")?;
        self.ackcommand(&format!("MOVE {}", position), None).await?;
        Ok(())
    }

    /// Stop motion, without acknowledgement.
    #[instrument(skip(self), fields(axis = %self.name), err)]
    pub async fn stop(&self) -> Result<()> {
        self.command("STOP", None).await?;
        Ok(())
    }

    /// Warning, alarm and power diagnostics, one section per query.
    pub async fn diagnostic(&self) -> Result<String> {
        let warning = self.ack_text("?WARNING").await?;
        let alarm = self.ack_text("?ALARM").await?;
        let pwrinfo = self.ack_text("?ISG ?PWRINFO").await?;
        let mut out = format!("WARNING: {}\nALARM  : {}\nPWRINFO: ", warning, alarm);
        out.push_str(&pwrinfo.lines().collect::<Vec<_>>().join("\n         "));
        out.push('\n');
        Ok(out)
    }
}

/// Parse a step count, accepting a float rendering.
pub(crate) fn parse_steps(text: &str) -> Option<i64> {
    let text = text.trim();
    text.parse::<i64>()
        .ok()
        .or_else(|| text.parse::<f64>().ok().filter(|v| v.is_finite()).map(|v| v as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moving_predicate() {
        let ready_powered = AxisStatus((1 << BIT_READY) | (1 << BIT_POWER_ON));
        assert!(!ready_powered.is_moving());

        assert!(AxisStatus(1 << BIT_MOVING).is_moving());
        assert!(AxisStatus(1 << BIT_SETTLING).is_moving());

        // Homing: not ready, powered, no MOVING/SETTLING
        assert!(AxisStatus(1 << BIT_POWER_ON).is_moving());
        // Fault: not ready, not powered
        assert!(!AxisStatus(0).is_moving());
    }

    #[test]
    fn coded_fields() {
        let status = AxisStatus((3 << 2) | (2 << 4) | (3 << 14));
        assert_eq!(status.mode().map(|c| c.name), Some("FAIL"));
        assert_eq!(status.disable().map(|c| c.name), Some("ALARM"));
        let stop = status.stop_code().unwrap();
        assert_eq!(stop.name, "SCLIMPOS");
        assert_eq!(stop.description, "positive limitswitch reached");

        assert!(AxisStatus(0).mode().is_none());
        assert!(AxisStatus(0).disable().is_none());
        assert!(AxisStatus(0).stop_code().is_none());
    }

    #[test]
    fn switches() {
        let status = AxisStatus((1 << 18) | (1 << 19) | (1 << 20) | (1 << 13) | (1 << 12));
        assert!(status.high_limit() && status.low_limit() && status.home());
        assert!(status.has_warning() && status.is_out_of_window());
    }

    #[test]
    fn hex_parsing_and_setters() {
        assert_eq!(AxisStatus::parse_hex("0x00800200"), Some(AxisStatus(0x0080_0200)));
        assert_eq!(AxisStatus::parse_hex("800200"), Some(AxisStatus(0x0080_0200)));
        assert_eq!(AxisStatus::parse_hex("zz"), None);

        let s = AxisStatus(0).with_moving(true).with_ready(true);
        assert!(s.moving_bit() && s.is_ready());
        assert!(!s.with_moving(false).moving_bit());
        assert_eq!(s.to_string(), "0x00000600");
    }

    #[test]
    fn flag_grammar() {
        let flags = AxisFlags::parse("mode=dontmove MODE=readonly").unwrap();
        assert!(flags.dontmove && flags.readonly && !flags.exclusive);
        assert_eq!(flags.to_string(), "mode=dontmove mode=readonly");

        assert_eq!(AxisFlags::parse("").unwrap(), AxisFlags::default());
        assert!(matches!(AxisFlags::parse("dontmove"), Err(IcepapError::InvalidOption(_))));
        assert!(AxisFlags::parse("mode=fast").is_err());
        assert!(AxisFlags::parse("speed=1").is_err());
    }

    #[tokio::test]
    async fn flag_checks() {
        let th = AxisNode::new(crate::controller::offline("ice1"), 1, Some("th"), AxisFlags::default()).unwrap();
        let dontmove = AxisFlags {
            dontmove: true,
            ..Default::default()
        };
        assert!(dontmove.check_write(&th, "set_pos").is_ok());
        match dontmove.check_motion(&th, "move") {
            Err(IcepapError::AxisProtected { host, axis, flag, .. }) => {
                assert_eq!((host.as_str(), axis.as_str(), flag), ("ice1", "th", "dontmove"));
            }
            other => panic!("unexpected {other:?}"),
        }
        let readonly = AxisFlags::parse("mode=readonly").unwrap();
        assert!(readonly.check_motion(&th, "move").is_err());
    }

    #[tokio::test]
    async fn group_flags_apply_to_direct_moves() {
        let th = AxisNode::new(crate::controller::offline("ice1"), 1, Some("th"), AxisFlags::default()).unwrap();
        th.set_group_flags(AxisFlags::parse("mode=dontmove").unwrap());
        assert!(th.effective_flags().dontmove);
        assert!(!th.flags().dontmove);
        let err = th.move_to(10).await.unwrap_err();
        assert!(matches!(err, IcepapError::AxisProtected { flag: "dontmove", .. }), "{err}");

        th.set_group_flags(AxisFlags::default());
        assert_eq!(th.effective_flags(), AxisFlags::default());
    }


    #[test]
    fn step_parsing() {
        assert_eq!(parse_steps(" 1200 "), Some(1200));
        assert_eq!(parse_steps("-3.0"), Some(-3));
        assert_eq!(parse_steps("nan"), None);
        assert_eq!(parse_steps("x"), None);
    }
}
