// SPDX-License-Identifier: PMPL-1.0-or-later
// Fuzz target for logical-log header parsing and payload extraction

#![no_main]

use libfuzzer_sys::fuzz_target;
use verisim_logstore::StreamId;
use verisim_overlay::header::build_record;
use verisim_overlay::{LogicalLogHeader, HEADER_SIZE};

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes as a metadata block must never panic the parser
    if let Ok(header) = LogicalLogHeader::parse(data) {
        let _ = header.payload(data, &[]);
        let _ = header.verify_data(data, &[]);
    }

    // A record built from the input parses back, and any single flipped
    // header byte is caught
    if data.len() < 2 {
        return;
    }
    let (control, payload) = data.split_at(2);
    let fixed_metadata = HEADER_SIZE as u32 + u32::from(control[0]);
    let header = LogicalLogHeader::new(StreamId::from_bytes([0u8; 16]), 1, 1, payload, control[1] & 1 == 1);
    let (metadata, io) = build_record(&header, payload, fixed_metadata);

    let parsed = LogicalLogHeader::parse(&metadata).expect("built header parses");
    assert_eq!(parsed.data_size as usize, payload.len());
    parsed.verify_data(&metadata, &io).expect("built record verifies");

    let mut corrupt = metadata.to_vec();
    let at = usize::from(control[1]) % HEADER_SIZE;
    corrupt[at] ^= 0x01;
    assert!(LogicalLogHeader::parse(&corrupt).is_err());
});
