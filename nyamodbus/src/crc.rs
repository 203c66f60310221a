/// Size of the trailing checksum
pub const CRC_LEN: usize = 2;

/// Modbus CRC16 (reflected polynomial 0xA001, initial value 0xFFFF).
pub fn crc16<'a>(bytes: impl IntoIterator<Item = &'a u8>) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for b in bytes.into_iter() {
        crc ^= u16::from(*b);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Checks the trailing two CRC bytes (low byte first) of a complete frame.
pub fn check_crc(frame: &[u8]) -> bool {
    if frame.len() < CRC_LEN {
        return false;
    }
    let (data, crc) = frame.split_at(frame.len() - CRC_LEN);
    crc16(data) == u16::from_le_bytes([crc[0], crc[1]])
}
