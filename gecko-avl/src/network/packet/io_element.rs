//! IO 元素组
//! 记录尾部的 key-value 对，按值宽度分成 1/2/4/8 字节四组，
//! id 和计数的位宽随 codec 变化

use bytes::Bytes;

use super::{avl::Codec, Error};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoElements {
    /// 触发本条记录的元素 id，0 表示周期上报
    pub event_id: u16,
    /// 四组元素的总数
    pub count: u16,
    pub one_byte: Vec<(u16, u8)>,
    pub two_byte: Vec<(u16, u16)>,
    pub four_byte: Vec<(u16, u32)>,
    pub eight_byte: Vec<(u16, u64)>,
}

impl IoElements {
    pub(crate) fn read(stream: &mut Bytes, codec: Codec) -> Result<Self, Error> {
        let event_id = codec.read_count(stream)?;
        let count = codec.read_count(stream)?;

        let n = codec.read_count(stream)?;
        let mut one_byte = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let id = codec.read_count(stream)?;
            one_byte.push((id, super::read_u8(stream)?));
        }

        let n = codec.read_count(stream)?;
        let mut two_byte = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let id = codec.read_count(stream)?;
            two_byte.push((id, super::read_u16(stream)?));
        }

        let n = codec.read_count(stream)?;
        let mut four_byte = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let id = codec.read_count(stream)?;
            four_byte.push((id, super::read_u32(stream)?));
        }

        let n = codec.read_count(stream)?;
        let mut eight_byte = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let id = codec.read_count(stream)?;
            eight_byte.push((id, super::read_u64(stream)?));
        }

        let total =
            one_byte.len() + two_byte.len() + four_byte.len() + eight_byte.len();
        if total != count as usize {
            return Err(Error::MalformedPacket);
        }

        Ok(Self {
            event_id,
            count,
            one_byte,
            two_byte,
            four_byte,
            eight_byte,
        })
    }

    /// 按 id 查值，不关心宽度
    pub fn value(&self, id: u16) -> Option<u64> {
        self.one_byte
            .iter()
            .find(|(i, _)| *i == id)
            .map(|(_, v)| *v as u64)
            .or_else(|| {
                self.two_byte
                    .iter()
                    .find(|(i, _)| *i == id)
                    .map(|(_, v)| *v as u64)
            })
            .or_else(|| {
                self.four_byte
                    .iter()
                    .find(|(i, _)| *i == id)
                    .map(|(_, v)| *v as u64)
            })
            .or_else(|| {
                self.eight_byte
                    .iter()
                    .find(|(i, _)| *i == id)
                    .map(|(_, v)| *v)
            })
    }

    pub fn u8_value(&self, id: u16) -> Option<u8> {
        self.one_byte
            .iter()
            .find(|(i, _)| *i == id)
            .map(|(_, v)| *v)
    }

    pub fn u16_value(&self, id: u16) -> Option<u16> {
        self.two_byte
            .iter()
            .find(|(i, _)| *i == id)
            .map(|(_, v)| *v)
    }

    /// 1 字节元素当布尔用，非零即真
    pub fn flag(&self, id: u16) -> Option<bool> {
        self.u8_value(id).map(|v| v != 0)
    }

    /// 按 (id, value) 迭代全部元素
    pub fn iter(&self) -> impl Iterator<Item = (u16, u64)> + '_ {
        self.one_byte
            .iter()
            .map(|(i, v)| (*i, *v as u64))
            .chain(self.two_byte.iter().map(|(i, v)| (*i, *v as u64)))
            .chain(self.four_byte.iter().map(|(i, v)| (*i, *v as u64)))
            .chain(self.eight_byte.iter().map(|(i, v)| (*i, *v)))
    }
}

/// TMT250 一类设备的元素 id 对照表，按 id 升序
/// 只用于日志和调试输出，语义投影见 store 层
const ELEMENT_NAMES: &[(u16, &str)] = &[
    (1, "digital_input_1"),
    (9, "analog_input_1"),
    (16, "total_odometer"),
    (17, "axis_x"),
    (18, "axis_y"),
    (19, "axis_z"),
    (21, "gsm_signal"),
    (24, "speed"),
    (66, "external_voltage"),
    (67, "battery_voltage"),
    (68, "battery_current"),
    (69, "gnss_status"),
    (80, "data_mode"),
    (112, "battery_capacity"),
    (113, "battery_level"),
    (116, "charger_connected"),
    (155, "geofence_zone_01"),
    (156, "geofence_zone_02"),
    (157, "geofence_zone_03"),
    (158, "geofence_zone_04"),
    (159, "geofence_zone_05"),
    (160, "geofence_zone_06"),
    (161, "geofence_zone_07"),
    (162, "geofence_zone_08"),
    (163, "geofence_zone_09"),
    (164, "geofence_zone_10"),
    (165, "geofence_zone_11"),
    (166, "geofence_zone_12"),
    (167, "geofence_zone_13"),
    (168, "geofence_zone_14"),
    (169, "geofence_zone_15"),
    (170, "geofence_zone_16"),
    (171, "geofence_zone_17"),
    (172, "geofence_zone_18"),
    (173, "geofence_zone_19"),
    (174, "geofence_zone_20"),
    (175, "auto_geofence"),
    (179, "digital_output_1"),
    (180, "digital_output_2"),
    (181, "gnss_pdop"),
    (182, "gnss_hdop"),
    (199, "trip_odometer"),
    (200, "sleep_mode"),
    (205, "gsm_cell_id"),
    (206, "gsm_area_code"),
    (220, "geofence_zone_21"),
    (221, "geofence_zone_22"),
    (222, "geofence_zone_23"),
    (223, "geofence_zone_24"),
    (224, "geofence_zone_25"),
    (225, "geofence_zone_26"),
    (226, "geofence_zone_27"),
    (227, "geofence_zone_28"),
    (228, "geofence_zone_29"),
    (229, "geofence_zone_30"),
    (230, "geofence_zone_31"),
    (231, "geofence_zone_32"),
    (239, "ignition"),
    (240, "movement"),
    (241, "active_gsm_operator"),
    (242, "man_down"),
    (243, "alarm"),
    (246, "towing"),
    (247, "crash_detection"),
    (249, "jamming"),
    (250, "trip"),
    (251, "idling"),
    (252, "unplug"),
    (253, "green_driving_type"),
    (254, "green_driving_value"),
    (255, "overspeeding"),
];

/// 查元素名，未知 id 返回 None
pub fn element_name(id: u16) -> Option<&'static str> {
    ELEMENT_NAMES
        .binary_search_by_key(&id, |(i, _)| *i)
        .ok()
        .map(|idx| ELEMENT_NAMES[idx].1)
}

/// 地理围栏 zone 元素的 id 是两段稀疏区间
pub fn geofence_zone(id: u16) -> Option<u8> {
    match id {
        155..=174 => Some((id - 154) as u8),
        220..=231 => Some((id - 199) as u8),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> IoElements {
        IoElements {
            event_id: 240,
            count: 4,
            one_byte: vec![(240, 1), (113, 87)],
            two_byte: vec![(67, 3962)],
            four_byte: vec![],
            eight_byte: vec![(16, 1000)],
        }
    }

    #[test]
    fn lookup_works() {
        let io = sample();
        assert_eq!(io.value(240), Some(1));
        assert_eq!(io.value(67), Some(3962));
        assert_eq!(io.value(16), Some(1000));
        assert_eq!(io.value(99), None);
        assert_eq!(io.flag(240), Some(true));
        assert_eq!(io.u16_value(67), Some(3962));
        assert_eq!(io.iter().count(), 4);
    }

    #[test]
    fn element_names_are_sorted() {
        // 表是二分查找的，顺序坏了所有查询都坏
        for pair in ELEMENT_NAMES.windows(2) {
            assert!(pair[0].0 < pair[1].0, "{:?} out of order", pair);
        }
        assert_eq!(element_name(240), Some("movement"));
        assert_eq!(element_name(67), Some("battery_voltage"));
        assert_eq!(element_name(2), None);
    }

    #[test]
    fn geofence_zones_work() {
        assert_eq!(geofence_zone(155), Some(1));
        assert_eq!(geofence_zone(174), Some(20));
        assert_eq!(geofence_zone(220), Some(21));
        assert_eq!(geofence_zone(231), Some(32));
        assert_eq!(geofence_zone(175), None);
        assert_eq!(geofence_zone(181), None);
        assert_eq!(geofence_zone(154), None);
        assert_eq!(geofence_zone(232), None);
    }
}
