#![no_main]

use libfuzzer_sys::fuzz_target;
use nyamodbus::config::PACKET_WAIT_TIMEOUT_US;
use nyamodbus::{Direction, Event, Parser};

fuzz_target!(|data: &[u8]| {
    for direction in [Direction::Request, Direction::Response] {
        let mut parser = Parser::new(direction);
        for byte in data {
            parser.start_timeout(PACKET_WAIT_TIMEOUT_US);
            if let Some(Event::Frame(frame)) = parser.feed(*byte) {
                assert!(nyamodbus::crc::check_crc(frame.as_bytes()));
            }
        }
        parser.tick(PACKET_WAIT_TIMEOUT_US);
        assert_eq!(parser.buffer().added(), 0);
    }
});
