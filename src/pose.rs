use anyhow::{bail, Result};
use std::fmt;

/// Pose のフィールド数
pub const POSE_FIELDS: usize = 13;
/// ControllerState のフィールド数
pub const CONTROLLER_FIELDS: usize = 22;

/// デバイス種別（パケット構成文字列の1文字）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Hmd,
    Controller,
    Tracker,
}

impl DeviceKind {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'h' => Some(Self::Hmd),
            'c' => Some(Self::Controller),
            't' => Some(Self::Tracker),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Self::Hmd => 'h',
            Self::Controller => 'c',
            Self::Tracker => 't',
        }
    }

    /// シリアライズ時のフィールド数
    pub fn field_count(self) -> usize {
        match self {
            Self::Hmd | Self::Tracker => POSE_FIELDS,
            Self::Controller => CONTROLLER_FIELDS,
        }
    }
}

/// 位置・回転・速度
///
/// 座標系: +x右, +y上, -z前（メートル）。回転はクォータニオン (w, x, y, z)。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub r_w: f64,
    pub r_x: f64,
    pub r_y: f64,
    pub r_z: f64,
    pub vel_x: f64,
    pub vel_y: f64,
    pub vel_z: f64,
    pub ang_vel_x: f64,
    pub ang_vel_y: f64,
    pub ang_vel_z: f64,
}

impl Default for Pose {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            r_w: 1.0,
            r_x: 0.0,
            r_y: 0.0,
            r_z: 0.0,
            vel_x: 0.0,
            vel_y: 0.0,
            vel_z: 0.0,
            ang_vel_x: 0.0,
            ang_vel_y: 0.0,
            ang_vel_z: 0.0,
        }
    }
}

impl Pose {
    pub fn set_position(&mut self, p: [f64; 3]) {
        self.x = p[0];
        self.y = p[1];
        self.z = p[2];
    }

    pub fn position(&self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }

    /// ワイヤ上の順序: x y z r_w r_x r_y r_z vel_x vel_y vel_z ang_vel_x ang_vel_y ang_vel_z
    pub fn fields(&self) -> [f64; POSE_FIELDS] {
        [
            self.x,
            self.y,
            self.z,
            self.r_w,
            self.r_x,
            self.r_y,
            self.r_z,
            self.vel_x,
            self.vel_y,
            self.vel_z,
            self.ang_vel_x,
            self.ang_vel_y,
            self.ang_vel_z,
        ]
    }

    pub fn from_fields(f: &[f64]) -> Option<Self> {
        if f.len() != POSE_FIELDS {
            return None;
        }
        Some(Self {
            x: f[0],
            y: f[1],
            z: f[2],
            r_w: f[3],
            r_x: f[4],
            r_y: f[5],
            r_z: f[6],
            vel_x: f[7],
            vel_y: f[8],
            vel_z: f[9],
            ang_vel_x: f[10],
            ang_vel_y: f[11],
            ang_vel_z: f[12],
        })
    }
}

/// コントローラの姿勢とボタン状態
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ControllerState {
    pub pose: Pose,
    /// 0 or 1
    pub grip: f64,
    pub system: f64,
    pub menu: f64,
    pub trackpad_click: f64,
    pub trigger_value: f64,
    /// -1 〜 1
    pub trackpad_x: f64,
    pub trackpad_y: f64,
    pub trackpad_touch: f64,
    pub trigger_click: f64,
}

impl ControllerState {
    /// Pose の13フィールドに続けて grip system menu trackpad_click trigger_value
    /// trackpad_x trackpad_y trackpad_touch trigger_click
    pub fn fields(&self) -> [f64; CONTROLLER_FIELDS] {
        let mut out = [0.0; CONTROLLER_FIELDS];
        out[..POSE_FIELDS].copy_from_slice(&self.pose.fields());
        out[POSE_FIELDS..].copy_from_slice(&[
            self.grip,
            self.system,
            self.menu,
            self.trackpad_click,
            self.trigger_value,
            self.trackpad_x,
            self.trackpad_y,
            self.trackpad_touch,
            self.trigger_click,
        ]);
        out
    }

    pub fn from_fields(f: &[f64]) -> Option<Self> {
        if f.len() != CONTROLLER_FIELDS {
            return None;
        }
        Some(Self {
            pose: Pose::from_fields(&f[..POSE_FIELDS])?,
            grip: f[13],
            system: f[14],
            menu: f[15],
            trackpad_click: f[16],
            trigger_value: f[17],
            trackpad_x: f[18],
            trackpad_y: f[19],
            trackpad_touch: f[20],
            trigger_click: f[21],
        })
    }
}

/// 1台分のデバイス状態
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Device {
    Hmd(Pose),
    Tracker(Pose),
    Controller(ControllerState),
}

impl Device {
    pub fn new(kind: DeviceKind) -> Self {
        match kind {
            DeviceKind::Hmd => Self::Hmd(Pose::default()),
            DeviceKind::Tracker => Self::Tracker(Pose::default()),
            DeviceKind::Controller => Self::Controller(ControllerState::default()),
        }
    }

    pub fn kind(&self) -> DeviceKind {
        match self {
            Self::Hmd(_) => DeviceKind::Hmd,
            Self::Tracker(_) => DeviceKind::Tracker,
            Self::Controller(_) => DeviceKind::Controller,
        }
    }

    pub fn pose(&self) -> &Pose {
        match self {
            Self::Hmd(p) | Self::Tracker(p) => p,
            Self::Controller(c) => &c.pose,
        }
    }

    pub fn pose_mut(&mut self) -> &mut Pose {
        match self {
            Self::Hmd(p) | Self::Tracker(p) => p,
            Self::Controller(c) => &mut c.pose,
        }
    }

    /// 固定順のフィールド列（長さは `kind().field_count()`）
    pub fn fields(&self) -> Vec<f64> {
        match self {
            Self::Hmd(p) | Self::Tracker(p) => p.fields().to_vec(),
            Self::Controller(c) => c.fields().to_vec(),
        }
    }

    pub fn from_fields(kind: DeviceKind, f: &[f64]) -> Option<Self> {
        match kind {
            DeviceKind::Hmd => Pose::from_fields(f).map(Self::Hmd),
            DeviceKind::Tracker => Pose::from_fields(f).map(Self::Tracker),
            DeviceKind::Controller => ControllerState::from_fields(f).map(Self::Controller),
        }
    }
}

/// パケット内のデバイス構成（例: "h c c"）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoseStruct {
    kinds: Vec<DeviceKind>,
}

impl PoseStruct {
    /// "h c c" 形式と "h13 c22 c22" 形式のどちらも受け付ける
    pub fn parse(text: &str) -> Result<Self> {
        let mut kinds = Vec::new();
        for token in text.split_whitespace() {
            let mut chars = token.chars();
            let Some(kind) = chars.next().and_then(DeviceKind::from_char) else {
                bail!("unknown device kind in {:?}", token);
            };
            let count = chars.as_str();
            if !count.is_empty() {
                match count.parse::<usize>() {
                    Ok(n) if n == kind.field_count() => {}
                    _ => bail!(
                        "device {:?} must have {} fields",
                        token,
                        kind.field_count()
                    ),
                }
            }
            kinds.push(kind);
        }
        if kinds.is_empty() {
            bail!("pose struct is empty");
        }
        Ok(Self { kinds })
    }

    pub fn kinds(&self) -> &[DeviceKind] {
        &self.kinds
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// パケット全体のフィールド数
    pub fn field_count(&self) -> usize {
        self.kinds.iter().map(|k| k.field_count()).sum()
    }

    /// ドライバに伝える構成文字列（例: "h13 c22 c22"）
    pub fn describe(&self) -> String {
        self.kinds
            .iter()
            .map(|k| format!("{}{}", k.as_char(), k.field_count()))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// 初期状態のデバイス列
    pub fn devices(&self) -> Vec<Device> {
        self.kinds.iter().map(|&k| Device::new(k)).collect()
    }
}

impl fmt::Display for PoseStruct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// 空白区切りの10進数 + 終端
pub fn encode_text(devices: &[Device], terminator: &[u8]) -> Vec<u8> {
    let text = devices
        .iter()
        .flat_map(|d| d.fields())
        .map(|v| format!("{:.6}", v))
        .collect::<Vec<_>>()
        .join(" ");
    let mut out = text.into_bytes();
    out.extend_from_slice(terminator);
    out
}

/// little-endian f32 の詰め込み + 終端
pub fn encode_binary(devices: &[Device], terminator: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(devices.len() * CONTROLLER_FIELDS * 4 + terminator.len());
    for v in devices.iter().flat_map(|d| d.fields()) {
        out.extend_from_slice(&(v as f32).to_le_bytes());
    }
    out.extend_from_slice(terminator);
    out
}

/// テキストパケット（終端なし）をデバイスごとに分解
pub fn parse_text_packet(line: &str, structure: &PoseStruct) -> Result<Vec<Device>> {
    let values = line
        .split_whitespace()
        .map(|s| s.parse::<f64>())
        .collect::<Result<Vec<_>, _>>()?;
    if values.len() != structure.field_count() {
        bail!(
            "expected {} fields for {}, got {}",
            structure.field_count(),
            structure,
            values.len()
        );
    }
    split_devices(&values, structure)
}

/// バイナリパケット（終端なし）をデバイスごとに分解
pub fn decode_binary(packet: &[u8], structure: &PoseStruct) -> Result<Vec<Device>> {
    let expected = structure.field_count() * 4;
    if packet.len() != expected {
        bail!(
            "expected {} bytes for {}, got {}",
            expected,
            structure,
            packet.len()
        );
    }
    let values: Vec<f64> = packet
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64)
        .collect();
    split_devices(&values, structure)
}

fn split_devices(values: &[f64], structure: &PoseStruct) -> Result<Vec<Device>> {
    let mut devices = Vec::with_capacity(structure.len());
    let mut rest = values;
    for &kind in structure.kinds() {
        let (head, tail) = rest.split_at(kind.field_count());
        match Device::from_fields(kind, head) {
            Some(d) => devices.push(d),
            None => bail!("malformed {:?} fields", kind),
        }
        rest = tail;
    }
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_describe() {
        let s = PoseStruct::parse("h c c").unwrap();
        assert_eq!(s.describe(), "h13 c22 c22");
        assert_eq!(s.field_count(), 57);
        assert_eq!(PoseStruct::parse("h13 c22 c22").unwrap(), s);
        assert_eq!(PoseStruct::parse("t t").unwrap().field_count(), 26);
    }

    #[test]
    fn test_parse_rejects_bad_struct() {
        assert!(PoseStruct::parse("").is_err());
        assert!(PoseStruct::parse("h x").is_err());
        assert!(PoseStruct::parse("h12").is_err());
    }

    #[test]
    fn test_field_order() {
        let mut c = ControllerState::default();
        c.pose.set_position([1.0, 2.0, 3.0]);
        c.grip = 1.0;
        c.trigger_click = 1.0;
        let f = c.fields();
        assert_eq!(&f[..4], &[1.0, 2.0, 3.0, 1.0]);
        assert_eq!(f[13], 1.0);
        assert_eq!(f[21], 1.0);
        assert_eq!(Device::Controller(c).fields().len(), CONTROLLER_FIELDS);
        assert_eq!(Device::new(DeviceKind::Tracker).fields().len(), POSE_FIELDS);
    }

    #[test]
    fn test_text_packet_parses_back() {
        let s = PoseStruct::parse("h c").unwrap();
        let mut devices = s.devices();
        devices[0].pose_mut().set_position([0.5, -0.25, 1.0]);
        if let Device::Controller(c) = &mut devices[1] {
            c.trackpad_x = -0.5;
        }
        let packet = encode_text(&devices, b"\n");
        assert!(packet.ends_with(b"\n"));

        let line = std::str::from_utf8(&packet[..packet.len() - 1]).unwrap();
        let parsed = parse_text_packet(line, &s).unwrap();
        assert_eq!(parsed, devices);
        assert!(parse_text_packet("1 2 3", &s).is_err());
    }

    #[test]
    fn test_binary_packet_layout() {
        let mut devices = PoseStruct::parse("t").unwrap().devices();
        devices[0].pose_mut().set_position([1.5, 0.0, -2.0]);
        let packet = encode_binary(&devices, b"\t\r\n");
        assert_eq!(packet.len(), POSE_FIELDS * 4 + 3);
        assert_eq!(&packet[..4], &1.5f32.to_le_bytes());
        assert_eq!(&packet[8..12], &(-2.0f32).to_le_bytes());
        assert_eq!(&packet[12..16], &1.0f32.to_le_bytes());
        assert!(packet.ends_with(b"\t\r\n"));
    }

    #[test]
    fn test_binary_packet_decodes() {
        let s = PoseStruct::parse("h c").unwrap();
        let mut devices = s.devices();
        devices[0].pose_mut().set_position([0.5, -0.25, 1.0]);
        if let Device::Controller(c) = &mut devices[1] {
            c.trigger_value = 0.75;
            c.trackpad_x = -0.5;
        }
        let packet = encode_binary(&devices, b"\t\r\n");
        let body = &packet[..packet.len() - 3];
        assert_eq!(decode_binary(body, &s).unwrap(), devices);

        assert!(decode_binary(&body[..body.len() - 4], &s).is_err());
        assert!(decode_binary(body, &PoseStruct::parse("h").unwrap()).is_err());
    }
}
