//! Command interpreter of the emulated controller.
//!
//! Pure state machine: one command line (and its binary payload, if any) in,
//! the reply text out. Motion advances by one step per status poll.

use crate::protocol::{classify, BinaryBlock, ParsedCommand, ProtocolMode};
use crate::trajectory::vdata::{ColumnKind, VectorData};
use std::collections::BTreeMap;

const BIT_READY: u32 = 1 << 9;
const BIT_MOVING: u32 = 1 << 10;
const BIT_POWER_ON: u32 = 1 << 23;

const KEYWORDS: &[(&str, &str)] = &[
    ("ACCTIME", "set acceleration time"),
    ("ALARM", "alarm condition"),
    ("FPOS", "fast position"),
    ("FSTATUS", "fast status"),
    ("HELP", "command list"),
    ("ISG", "forward to the driver"),
    ("MOVE", "absolute move"),
    ("MOVEP", "move onto parametric trajectory"),
    ("PARACCT", "parameter acceleration time"),
    ("PARDAT", "parametric trajectory data"),
    ("PARPOS", "parameter position"),
    ("PARVEL", "parameter velocity"),
    ("PING", "liveness probe"),
    ("PMOVE", "parametric move"),
    ("POS", "position"),
    ("POWER", "driver power"),
    ("PWRINFO", "power information"),
    ("STATUS", "status word"),
    ("STOP", "stop motion"),
    ("VELOCITY", "velocity"),
    ("VER", "firmware version"),
    ("WARNING", "warning condition"),
    ("_SOCKPING", "socket liveness probe"),
];

/// Simulated state of one axis.
#[derive(Debug, Clone, PartialEq)]
pub struct AxisSnapshot {
    /// Current position in steps.
    pub position: i64,
    /// Position at the end of the current motion.
    pub target: i64,
    /// Remaining status polls before the motion completes.
    pub polls_left: u32,
    /// Driver power.
    pub power: bool,
    /// Velocity in steps/s.
    pub velocity: f64,
    /// Acceleration time in seconds.
    pub acctime: f64,
    /// Parameter velocity.
    pub parameter_velocity: f64,
    /// Parameter acceleration time.
    pub parameter_acctime: f64,
    /// Current parameter position.
    pub parameter: f64,
    /// Downloaded trajectory: parameter and position columns.
    pub table: Option<(Vec<f64>, Vec<f64>)>,
    /// Power requests are acknowledged but never take effect.
    pub power_fails: bool,
}

impl Default for AxisSnapshot {
    fn default() -> Self {
        Self {
            position: 0,
            target: 0,
            polls_left: 0,
            power: true,
            velocity: 2000.0,
            acctime: 0.25,
            parameter_velocity: 1.0,
            parameter_acctime: 0.1,
            parameter: 0.0,
            table: None,
            power_fails: false,
        }
    }
}

impl AxisSnapshot {
    fn status(&self) -> u32 {
        let mut word = 0;
        if self.power {
            word |= BIT_POWER_ON;
        }
        if self.polls_left > 0 {
            word |= BIT_MOVING;
        } else if self.power {
            word |= BIT_READY;
        }
        word
    }

    fn start(&mut self, target: i64, polls: u32) {
        self.target = target;
        if polls == 0 || target == self.position {
            self.position = target;
            self.polls_left = 0;
        } else {
            self.polls_left = polls;
        }
    }

    fn poll(&mut self) {
        if self.polls_left > 0 {
            self.polls_left -= 1;
            if self.polls_left == 0 {
                self.position = self.target;
            }
        }
    }

    fn halt(&mut self) {
        self.polls_left = 0;
        self.target = self.position;
    }

    fn interpolate(&self, parameter: f64) -> Option<i64> {
        let (params, positions) = self.table.as_ref()?;
        let first = *params.first()?;
        let last = *params.last()?;
        let p = parameter.clamp(first.min(last), first.max(last));
        let index = params.windows(2).position(|w| p >= w[0].min(w[1]) && p <= w[0].max(w[1]));
        let value = match index {
            Some(i) if params[i + 1] != params[i] => {
                let t = (p - params[i]) / (params[i + 1] - params[i]);
                positions[i] + t * (positions[i + 1] - positions[i])
            }
            Some(i) => positions[i],
            None => *positions.first()?,
        };
        Some(value.round() as i64)
    }
}

/// Emulated controller state shared by every connection.
#[derive(Debug)]
pub struct DeviceState {
    pub(crate) mode: ProtocolMode,
    pub(crate) axes: BTreeMap<u16, AxisSnapshot>,
    pub(crate) motion_polls: u32,
    pub(crate) commands: Vec<String>,
}

type Answer = Result<Vec<String>, String>;

impl DeviceState {
    /// Controller with `addresses` populated.
    pub fn new(mode: ProtocolMode, addresses: &[u16]) -> Self {
        Self {
            mode,
            axes: addresses.iter().map(|a| (*a, AxisSnapshot::default())).collect(),
            motion_polls: 2,
            commands: Vec::new(),
        }
    }

    /// Whether `line` is followed by a binary block.
    pub fn expects_payload(line: &str) -> bool {
        classify(line).is_ok_and(|p| p.binary && !p.query)
    }

    /// Interpret one line and return the bytes to send back, if any.
    pub fn execute(&mut self, line: &str, payload: Option<BinaryBlock>) -> Option<String> {
        self.commands.push(line.to_string());
        let parsed = match classify(line) {
            Ok(parsed) => parsed,
            Err(err) => return Some(format!("ERROR {}\n", err)),
        };
        let prefix = parsed.reply_prefix(self.mode.echoes_address());
        let answer = self.answer(&parsed, payload);
        if !parsed.class().expects_answer() {
            return None;
        }
        Some(match answer {
            Ok(lines) if lines.len() == 1 => format!("{} {}\n", prefix, lines[0]),
            Ok(lines) => format!("{} $\n{}\n$\n", prefix, lines.join("\n")),
            Err(message) => format!("{} ERROR {}\n", prefix, message),
        })
    }

    fn axis(&mut self, address: &str) -> Result<&mut AxisSnapshot, String> {
        let address: u16 = address.parse().map_err(|_| format!("Bad axis address {}", address))?;
        self.axes
            .get_mut(&address)
            .ok_or_else(|| format!("Axis {} not present", address))
    }

    fn answer(&mut self, parsed: &ParsedCommand, payload: Option<BinaryBlock>) -> Answer {
        let params: Vec<&str> = parsed.params.split_whitespace().collect();
        match parsed.address.as_deref() {
            Some(addr) if !addr.is_empty() => self.axis_command(addr, parsed, &params),
            _ => self.system_command(parsed, &params, payload),
        }
    }

    fn axis_command(&mut self, address: &str, parsed: &ParsedCommand, params: &[&str]) -> Answer {
        let polls = self.motion_polls;
        let axis = self.axis(address)?;
        let one = |s: String| -> Answer { Ok(vec![s]) };
        match (parsed.query, parsed.keyword.as_str()) {
            (true, "POS") | (true, "FPOS") => one(axis.position.to_string()),
            (true, "STATUS") | (true, "FSTATUS") => {
                axis.poll();
                one(format!("0x{:08x}", axis.status()))
            }
            (true, "POWER") => one(if axis.power { "ON" } else { "OFF" }.to_string()),
            (true, "WARNING") => one("NONE".to_string()),
            (true, "ALARM") => one("NO".to_string()),
            (_, "ISG") if params.first().is_some_and(|p| p.eq_ignore_ascii_case("?PWRINFO")) => Ok(vec![
                format!("Power: {}", if axis.power { "ON" } else { "OFF" }),
                "Supply: 80V OK".to_string(),
            ]),
            (false, "MOVE") => {
                let target = parse_i64(params.first().copied())?;
                if !axis.power {
                    return Err("Axis power is off".to_string());
                }
                axis.start(target, polls);
                one("OK".to_string())
            }
            (false, "STOP") => {
                axis.halt();
                one("OK".to_string())
            }
            (false, "POWER") => {
                let on = parse_on_off(params.first().copied())?;
                if !axis.power_fails {
                    axis.power = on;
                }
                one("OK".to_string())
            }
            _ => Err("Command not recognised".to_string()),
        }
    }

    fn system_command(&mut self, parsed: &ParsedCommand, params: &[&str], payload: Option<BinaryBlock>) -> Answer {
        let polls = self.motion_polls;
        let keyword = parsed.keyword.as_str();
        if parsed.query {
            return match keyword {
                "_SOCKPING" | "PING" => Ok(vec!["OK".to_string()]),
                "VER" => Ok(vec!["3.17".to_string()]),
                "HELP" => Ok(self.help(params)),
                "FSTATUS" | "STATUS" => self.per_axis(params, |a| {
                    a.poll();
                    format!("0x{:08x}", a.status())
                }),
                "FPOS" | "POS" => self.per_axis(params, |a| a.position.to_string()),
                "POWER" => self.per_axis(params, |a| if a.power { "ON" } else { "OFF" }.to_string()),
                "VELOCITY" => self.per_axis(params, |a| a.velocity.to_string()),
                "ACCTIME" => self.per_axis(params, |a| a.acctime.to_string()),
                "PARVEL" => self.per_axis(params, |a| a.parameter_velocity.to_string()),
                "PARACCT" => self.per_axis(params, |a| a.parameter_acctime.to_string()),
                "PARPOS" => self.per_axis(params, |a| a.parameter.to_string()),
                _ => Err("Command not recognised".to_string()),
            };
        }

        match keyword {
            "POS" => self.per_pair(params, |a, v| {
                a.position = parse_i64(Some(v.as_str()))?;
                a.target = a.position;
                Ok(())
            }),
            "VELOCITY" => self.per_pair(params, |a, v| {
                a.velocity = parse_f64(Some(v.as_str()))?;
                Ok(())
            }),
            "ACCTIME" => self.per_pair(params, |a, v| {
                a.acctime = parse_f64(Some(v.as_str()))?;
                Ok(())
            }),
            "MOVE" if params.first().is_some_and(|p| p.eq_ignore_ascii_case("GROUP")) => {
                self.per_pair(&params[1..], |a, v| {
                    if !a.power {
                        return Err("Axis power is off".to_string());
                    }
                    a.start(parse_i64(Some(v.as_str()))?, polls);
                    Ok(())
                })
            }
            "STOP" => self.per_axis(params, |a| {
                a.halt();
                String::new()
            }).map(|_| vec!["OK".to_string()]),
            "POWER" => {
                let on = parse_on_off(params.first().copied())?;
                self.per_axis(&params[1..], |a| {
                    if !a.power_fails {
                        a.power = on;
                    }
                    String::new()
                })
                .map(|_| vec!["OK".to_string()])
            }
            "PARVEL" => {
                let value = parse_f64(params.first().copied())?;
                self.per_axis(&params[1..], |a| {
                    a.parameter_velocity = value;
                    String::new()
                })
                .map(|_| vec!["OK".to_string()])
            }
            "PARACCT" => {
                let value = parse_f64(params.first().copied())?;
                self.per_axis(&params[1..], |a| {
                    a.parameter_acctime = value;
                    String::new()
                })
                .map(|_| vec!["OK".to_string()])
            }
            "PARDAT" if parsed.binary => {
                let block = payload.ok_or_else(|| "Binary data missing".to_string())?;
                self.load_table(params, block.as_bytes())
            }
            "MOVEP" | "PMOVE" => {
                let parameter = parse_f64(params.first().copied())?;
                for address in &params[1..] {
                    let axis = self.axis(address)?;
                    let target = axis
                        .interpolate(parameter)
                        .ok_or_else(|| format!("No trajectory loaded on axis {}", address))?;
                    if !axis.power {
                        return Err("Axis power is off".to_string());
                    }
                    axis.parameter = parameter;
                    axis.start(target, polls);
                }
                Ok(vec!["OK".to_string()])
            }
            _ => Err("Command not recognised".to_string()),
        }
    }

    fn help(&self, params: &[&str]) -> Vec<String> {
        match self.mode {
            ProtocolMode::IcePap => vec![KEYWORDS.iter().map(|(k, _)| *k).collect::<Vec<_>>().join(" ")],
            ProtocolMode::Deep if params.first().is_some_and(|p| p.eq_ignore_ascii_case("ALL")) => {
                KEYWORDS.iter().map(|(k, d)| format!("{}: {}", k, d)).collect()
            }
            ProtocolMode::Deep => vec![KEYWORDS.len().to_string()],
        }
    }

    fn per_axis(&mut self, addresses: &[&str], mut f: impl FnMut(&mut AxisSnapshot) -> String) -> Answer {
        if addresses.is_empty() {
            return Err("Missing axis address".to_string());
        }
        let mut values = Vec::with_capacity(addresses.len());
        for address in addresses {
            values.push(f(self.axis(address)?));
        }
        Ok(vec![values.join(" ")])
    }

    fn per_pair(
        &mut self,
        params: &[&str],
        mut f: impl FnMut(&mut AxisSnapshot, String) -> Result<(), String>,
    ) -> Answer {
        if params.is_empty() || params.len() % 2 != 0 {
            return Err("Wrong number of parameters".to_string());
        }
        // Validate every address before touching any axis.
        for pair in params.chunks(2) {
            self.axis(pair[0])?;
        }
        for pair in params.chunks(2) {
            f(self.axis(pair[0])?, pair[1].to_string())?;
        }
        Ok(vec!["OK".to_string()])
    }

    fn load_table(&mut self, addresses: &[&str], data: &[u8]) -> Answer {
        let columns = VectorData::parse(data).map_err(|e| e.to_string())?;
        let parameter = columns
            .iter()
            .find(|c| c.kind == ColumnKind::Parameter)
            .map(|c| c.values.clone())
            .ok_or_else(|| "Missing parameter vector".to_string())?;
        for address in addresses {
            let number: u16 = address.parse().map_err(|_| format!("Bad axis address {}", address))?;
            let positions = columns
                .iter()
                .find(|c| c.kind == ColumnKind::Position && c.address == number)
                .map(|c| c.values.clone())
                .ok_or_else(|| format!("Missing position vector for axis {}", number))?;
            if positions.len() != parameter.len() {
                return Err(format!("Vector length mismatch for axis {}", number));
            }
            self.axis(address)?.table = Some((parameter.clone(), positions));
        }
        Ok(vec!["OK".to_string()])
    }
}

fn parse_i64(text: Option<&str>) -> Result<i64, String> {
    let text = text.ok_or_else(|| "Missing parameter".to_string())?;
    text.parse().map_err(|_| format!("Bad integer {}", text))
}

fn parse_f64(text: Option<&str>) -> Result<f64, String> {
    let text = text.ok_or_else(|| "Missing parameter".to_string())?;
    text.parse().map_err(|_| format!("Bad number {}", text))
}

fn parse_on_off(text: Option<&str>) -> Result<bool, String> {
    match text.map(|t| t.to_uppercase()).as_deref() {
        Some("ON") => Ok(true),
        Some("OFF") => Ok(false),
        _ => Err("Expected ON or OFF".to_string()),
    }
}
