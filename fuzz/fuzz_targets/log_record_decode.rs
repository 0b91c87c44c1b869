#![no_main]

use layerkv::wal::{LogRecord, Replayer};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let line = String::from_utf8_lossy(data);
    if let Ok(Some(record)) = LogRecord::decode(&line) {
        let encoded = record.encode();
        assert_eq!(LogRecord::decode(&encoded), Ok(Some(record)));
    }

    let mut replayer = Replayer::new();
    for line in line.split('\n') {
        let _ = replayer.apply_line(line);
    }
    let _ = replayer.finish();
});
