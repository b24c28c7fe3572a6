use bytes::Bytes;

use super::*;
use crate::cell::{CellBuilder, HashBytes};
use crate::util::{decode_base64, make_random_tree};

const CONTRACT_BOC: &str = "te6ccgECTAEADjkAAgaK2zVLAQQkiu1TIOMDIMD/4wIgwP7jAvILQgMCRwO+7UTQ10nDAfhmifhpIds80wABjhqBAgDXGCD5AQHTAAGU0/8DAZMC+ELi+RDyqJXTAAHyeuLTPwH4QyG58rQg+COBA+iogggbd0CgufK0+GPTHwH4I7zyudMfAds88jxIDwQEfO1E0NdJwwH4ZiLQ0wP6QDD4aak4APhEf29xggiYloBvcm1vc3BvdPhk4wIhxwDjAiHXDR/yvCHjAwHbPPI8Pz4+BAIoIIIQZ6C5X7vjAiCCEH1v8lS74wISBQM8IIIQaLVfP7rjAiCCEHPiIUO64wIgghB9b/JUuuMCDggGAzYw+Eby4Ez4Qm7jACGT1NHQ3vpA0ds8MNs88gBBB0YAaPhL+EnHBfLj6PhL+E34SnDIz4WAygBzz0DOcc8LblUgyM+QU/a2gssfzgHIzs3NyYBA+wADTjD4RvLgTPhCbuMAIZPU0dDe03/6QNN/1NHQ+kDSANTR2zww2zzyAEEJRgRu+Ev4SccF8uPoJcIA8uQaJfhMu/LkJCT6Qm8T1wv/wwAl+EvHBbOw8uQG2zxw+wJVA9s8iSXCAEktSAoBmo6AnCH5AMjPigBAy//J0OIx+EwnobV/+GxVIQL4S1UGVQR/yM+FgMoAc89AznHPC25VQMjPkZ6C5X7Lf85VIMjOygDMzc3JgQCA+wBbCwEKVHFU2zwMArj4S/hN+EGIyM+OK2zWzM7JVQQg+QD4KPpCbxLIz4ZAygfL/8nQBibIz4WIzgH6AovQAAAAAAAAAAAAAAAAB88WIds8zM+DVTDIz5BWgOPuzMsfzgHIzs3NyXH7AEsNADTQ0gABk9IEMd7SAAGT0gEx3vQE9AT0BNFfAwEcMPhCbuMA+Ebyc9HywGQPAhbtRNDXScIBjoDjDRBBA2Zw7UTQ9AVxIYBA9A6OgN9yIoBA9A6OgN9wIIj4bvht+Gz4a/hqgED0DvK91wv/+GJw+GMREUcBAolIBFAgghAPAliqu+MCIIIQIOvHbbvjAiCCEEap1+y74wIgghBnoLlfu+MCMCUcEwRQIIIQSWlYf7rjAiCCEFYlSK264wIgghBmXc6fuuMCIIIQZ6C5X7rjAhoYFhQDSjD4RvLgTPhCbuMAIZPU0dDe03/6QNTR0PpA0gDU0ds8MNs88gBBFUYC5PhJJNs8+QDIz4oAQMv/ydDHBfLkTNs8cvsC+EwloLV/+GwBjjVTAfhJU1b4SvhLcMjPhYDKAHPPQM5xzwtuVVDIz5HDYn8mzst/VTDIzlUgyM5ZyM7Mzc3NzZohyM+FCM6Ab89A4smBAICmArUH+wBfBC1JA+ww+Eby4Ez4Qm7jANMf+ERYb3X4ZNHbPCGOJSPQ0wH6QDAxyM+HIM6NBAAAAAAAAAAAAAAAAA5l3On4zxbMyXCOLvhEIG8TIW8S+ElVAm8RyHLPQMoAc89AzgH6AvQAgGrPQPhEbxXPCx/MyfhEbxTi+wDjAPIAQRc8ATT4RHBvcoBAb3Rwb3H4ZPhBiMjPjits1szOyUsDRjD4RvLgTPhCbuMAIZPU0dDe03/6QNTR0PpA1NHbPDDbPPIAQRlGARb4S/hJxwXy4+jbPDUD8DD4RvLgTPhCbuMA0x/4RFhvdfhk0ds8IY4mI9DTAfpAMDHIz4cgzo0EAAAAAAAAAAAAAAAADJaVh/jPFst/yXCOL/hEIG8TIW8S+ElVAm8RyHLPQMoAc89AzgH6AvQAgGrPQPhEbxXPCx/Lf8n4RG8U4vsA4wDyAEEbPAAg+ERwb3KAQG90cG9x+GT4TARQIIIQMgTsKbrjAiCCEEOE8pi64wIgghBEV0KEuuMCIIIQRqnX7LrjAiMhHx0DSjD4RvLgTPhCbuMAIZPU0dDe03/6QNTR0PpA0gDU0ds8MNs88gBBHkYBzPhL+EnHBfLj6CTCAPLkGiT4TLvy5CQj+kJvE9cL/8MAJPgoxwWzsPLkBts8cPsC+EwlobV/+GwC+EtVE3/Iz4WAygBzz0DOcc8LblVAyM+RnoLlfst/zlUgyM7KAMzNzcmBAID7AEkD4jD4RvLgTPhCbuMA0x/4RFhvdfhk0ds8IY4dI9DTAfpAMDHIz4cgznHPC2EByM+TEV0KEs7NyXCOMfhEIG8TIW8S+ElVAm8RyHLPQMoAc89AzgH6AvQAcc8LaQHI+ERvFc8LH87NyfhEbxTi+wDjAPIAQSA8ACD4RHBvcoBAb3Rwb3H4ZPhKA0Aw+Eby4Ez4Qm7jACGT1NHQ3tN/+kDSANTR2zww2zzyAEEiRgHw+Er4SccF8uPy2zxy+wL4TCSgtX/4bAGOMlRwEvhK+EtwyM+FgMoAc89AznHPC25VMMjPkep7eK7Oy39ZyM7Mzc3JgQCApgK1B/sAjigh+kJvE9cL/8MAIvgoxwWzsI4UIcjPhQjOgG/PQMmBAICmArUH+wDe4l8DSQP0MPhG8uBM+EJu4wDTH/hEWG91+GTTH9HbPCGOJiPQ0wH6QDAxyM+HIM6NBAAAAAAAAAAAAAAAAAsgTsKYzxbKAMlwji/4RCBvEyFvEvhJVQJvEchyz0DKAHPPQM4B+gL0AIBqz0D4RG8VzwsfygDJ+ERvFOL7AOMA8gBBJDwAmvhEcG9ygEBvdHBvcfhkIIIQMgTsKbohghBPR5+juiKCECpKxD66I4IQViVIrbokghAML/INuiWCEH7cHTe6VQWCEA8CWKq6sbGxsbGxBFAgghATMqkxuuMCIIIQFaA4+7rjAiCCEB8BMpG64wIgghAg68dtuuMCLiooJgM0MPhG8uBM+EJu4wAhk9TR0N76QNHbPOMA8gBBJzwBQvhL+EnHBfLj6Ns8cPsCyM+FCM6Ab89AyYEAgKYCtQf7AEoD4jD4RvLgTPhCbuMA0x/4RFhvdfhk0ds8IY4dI9DTAfpAMDHIz4cgznHPC2EByM+SfATKRs7NyXCOMfhEIG8TIW8S+ElVAm8RyHLPQMoAc89AzgH6AvQAcc8LaQHI+ERvFc8LH87NyfhEbxTi+wDjAPIAQSk8ACD4RHBvcoBAb3Rwb3H4ZPhLA0ww+Eby4Ez4Qm7jACGW1NMf1NHQk9TTH+L6QNTR0PpA0ds84wDyAEErPAJ4+En4SscFII6A3/LgZNs8cPsCIPpCbxPXC//DACH4KMcFs7COFCDIz4UIzoBvz0DJgQCApgK1B/sA3l8ELEkBJjAh2zz5AMjPigBAy//J0PhJxwUtAFRwyMv/cG2AQPRD+EpxWIBA9BYBcliAQPQWyPQAyfhOyM+EgPQA9ADPgckD8DD4RvLgTPhCbuMA0x/4RFhvdfhk0ds8IY4mI9DTAfpAMDHIz4cgzo0EAAAAAAAAAAAAAAAACTMqkxjPFssfyXCOL/hEIG8TIW8S+ElVAm8RyHLPQMoAc89AzgH6AvQAgGrPQPhEbxXPCx/LH8n4RG8U4vsA4wDyAEEvPAAg+ERwb3KAQG90cG9x+GT4TQRMIIIIhX76uuMCIIILNpGZuuMCIIIQDC/yDbrjAiCCEA8CWKq64wI7NjMxAzYw+Eby4Ez4Qm7jACGT1NHQ3vpA0ds8MNs88gBBMkYAQvhL+EnHBfLj6PhM8tQuyM+FCM6Ab89AyYEAgKYgtQf7AANGMPhG8uBM+EJu4wAhk9TR0N7Tf/pA1NHQ+kDU0ds8MNs88gBBNEYBFvhK+EnHBfLj8ts8NQGaI8IA8uQaI/hMu/LkJNs8cPsC+EwkobV/+GwC+EtVA/hKf8jPhYDKAHPPQM5xzwtuVUDIz5BkrUbGy3/OVSDIzlnIzszNzc3JgQCA+wBJA0Qw+Eby4Ez4Qm7jACGW1NMf1NHQk9TTH+L6QNHbPDDbPPIAQTdGAij4SvhJxwXy4/L4TSK6joCOgOJfAzo4AXL4SsjO+EsBzvhMAct/+E0Byx9SIMsfUhDO+E4BzCP7BCPQIIs4rbNYxwWT103Q3tdM0O0e7VPJ2zw5AATwAgEy2zxw+wIgyM+FCM6Ab89AyYEAgKYCtQf7AEkD7DD4RvLgTPhCbuMA0x/4RFhvdfhk0ds8IY4lI9DTAfpAMDHIz4cgzo0EAAAAAAAAAAAAAAAACAhX76jPFszJcI4u+EQgbxMhbxL4SVUCbxHIcs9AygBzz0DOAfoC9ACAas9A+ERvFc8LH8zJ+ERvFOL7AOMA8gBBPTwAKO1E0NP/0z8x+ENYyMv/yz/Oye1UACD4RHBvcoBAb3Rwb3H4ZPhOAAr4RvLgTAO8IdYfMfhG8uBM+EJu4wDbPHL7AiDTHzIgghBnoLlfuo49IdN/M/hMIaC1f/hs+EkB+Er4S3DIz4WAygBzz0DOcc8LblUgyM+Qn0I3ps7LfwHIzs3NyYEAgKYCtQf7AEFJQAGMjkAgghAZK1Gxuo41IdN/M/hMIaC1f/hs+Er4S3DIz4WAygBzz0DOcc8LblnIz5BwyoK2zst/zcmBAICmArUH+wDe4lvbPEYASu1E0NP/0z/TADH6QNTR0PpA03/TH9TR+G74bfhs+Gv4avhj+GICCvSkIPShREMAFHNvbCAwLjU3LjEELKAAAAAC2zxy+wKJ+GqJ+Gtw+Gxw+G1JSEhFA6aI+G6JAdAg+kD6QNN/0x/TH/pAN15A+Gr4a/hsMPhtMtQw+G4g+kJvE9cL/8MAIfgoxwWzsI4UIMjPhQjOgG/PQMmBAICmArUH+wDeMNs8+A/yAEdIRgBG+E74TfhM+Ev4SvhD+ELIy//LP8+DzlUwyM7Lf8sfzM3J7VQAAABDgAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAEAEe+CdvEGim/mChtX/bPLYJSgAMghAF9eEAAAwg+GHtHtk=";

fn shared_tree() -> Cell {
    let mut shared = CellBuilder::new();
    shared.store_u32(0xdead).unwrap();
    let shared = shared.build().unwrap();

    let mut left = CellBuilder::new();
    left.store_bit(true).unwrap();
    left.store_reference(shared.clone()).unwrap();
    let left = left.build().unwrap();

    let mut root = CellBuilder::new();
    root.store_u16(0xbeef).unwrap();
    root.store_reference(left).unwrap();
    root.store_reference(shared).unwrap();
    root.build().unwrap()
}

#[test]
fn boc_with_crc() {
    let boc_without_crc = decode_base64(CONTRACT_BOC).unwrap();

    let cell = Boc::decode(&boc_without_crc).unwrap();

    let mut boc_with_crc = Vec::new();
    ser::BocHeader::with_root(cell.as_ref())
        .with_crc(true)
        .encode(&mut boc_with_crc)
        .unwrap();
    assert_eq!(boc_without_crc.len() + 4, boc_with_crc.len());

    let decoded = Boc::decode(&boc_with_crc).unwrap();
    assert_eq!(decoded.as_ref(), cell.as_ref());

    let last_byte = boc_with_crc.last_mut().unwrap();
    *last_byte = !*last_byte;

    assert_eq!(Boc::decode(&boc_with_crc), Err(de::Error::InvalidChecksum));
    assert!(matches!(
        LazyBoc::new(Bytes::from(boc_with_crc)),
        Err(de::Error::InvalidChecksum)
    ));
}

#[test]
fn corrupted_payload_with_crc() {
    let cell = make_random_tree(1, 100);
    let mut data = Boc::encode_ext(cell.as_ref(), BocMode::WITH_CRC32C).unwrap();

    // Flip a bit somewhere in the cells data
    let middle = data.len() / 2;
    data[middle] ^= 0x01;
    assert_eq!(Boc::decode(&data), Err(de::Error::InvalidChecksum));
}

#[test]
fn fixture_layout_is_detected() {
    let data = decode_base64(CONTRACT_BOC).unwrap();
    let decoded = Boc::decode_all(&data, Cell::empty_context()).unwrap();
    assert_eq!(decoded.tag, BocTag::Generic);
    assert_eq!(decoded.mode, BocMode::empty());
    assert!(decoded.get_root(1).is_none());

    let reencoded = decoded.encode().unwrap();
    assert_eq!(reencoded.len(), data.len());
    assert_eq!(reencoded, Boc::encode(decoded.get_root(0).unwrap()));
}

#[test]
fn all_modes_roundtrip() {
    let cell = make_random_tree(42, 300);

    let flags = [
        BocMode::WITH_INDEX,
        BocMode::WITH_CRC32C,
        BocMode::WITH_TOP_HASH,
        BocMode::WITH_INT_HASHES,
        BocMode::WITH_CACHE_BITS,
    ];
    for bits in 0u8..32 {
        let mut mode = BocMode::empty();
        for (i, flag) in flags.iter().enumerate() {
            if bits & (1 << i) != 0 {
                mode |= *flag;
            }
        }

        let encoded = Boc::encode_ext(cell.as_ref(), mode);
        if mode.contains(BocMode::WITH_CACHE_BITS) && !mode.contains(BocMode::WITH_INDEX) {
            assert_eq!(encoded, Err(ser::Error::CacheBitsWithoutIndex));
            continue;
        }
        let encoded = encoded.unwrap();

        let decoded = Boc::decode_all(&encoded, Cell::empty_context()).unwrap();
        assert_eq!(decoded.roots.len(), 1);
        assert_eq!(decoded.roots[0].repr_hash(), cell.repr_hash());
        assert_eq!(decoded.encode().unwrap(), encoded, "mode: {mode:?}");

        let lazy = LazyBoc::new(Bytes::from(encoded.clone())).unwrap();
        let lazy_mode = lazy.mode().unwrap();
        assert_eq!(lazy_mode, decoded.mode, "mode: {mode:?}");

        let root = lazy.get_root(0).unwrap();
        assert_eq!(root.repr_hash(), cell.repr_hash());
        assert_eq!(
            Boc::encode_ext(root.as_ref(), lazy_mode).unwrap(),
            encoded,
            "mode: {mode:?}"
        );
    }
}

#[test]
fn legacy_tags_roundtrip() {
    let cell = make_random_tree(7, 50);

    for (tag, mode) in [
        (BocTag::Indexed, BocMode::WITH_INDEX),
        (BocTag::IndexedCrc32, BocMode::WITH_INDEX | BocMode::WITH_CRC32C),
    ] {
        let mut encoded = Vec::new();
        ser::BocHeader::with_root(cell.as_ref())
            .with_tag(tag)
            .with_mode(mode)
            .encode(&mut encoded)
            .unwrap();
        assert_eq!(&encoded[..4], tag.to_bytes().as_slice());

        let decoded = Boc::decode_all(&encoded, Cell::empty_context()).unwrap();
        assert_eq!(decoded.tag, tag);
        assert_eq!(decoded.mode, mode);
        assert_eq!(decoded.roots[0].as_ref(), cell.as_ref());
        assert_eq!(decoded.encode().unwrap(), encoded);

        let lazy = LazyBoc::new(Bytes::from(encoded.clone())).unwrap();
        assert_eq!(lazy.tag(), tag);
        assert_eq!(lazy.mode().unwrap(), mode);

        let root = lazy.get_root(0).unwrap();
        assert_eq!(root.as_ref(), cell.as_ref());

        let mut reencoded = Vec::new();
        ser::BocHeader::with_root(root.as_ref())
            .with_tag(lazy.tag())
            .with_mode(lazy.mode().unwrap())
            .encode(&mut reencoded)
            .unwrap();
        assert_eq!(reencoded, encoded);
    }

    // Legacy tags have a fixed set of flags
    let mut target = Vec::new();
    let res = ser::BocHeader::with_root(cell.as_ref())
        .with_tag(BocTag::Indexed)
        .with_mode(BocMode::WITH_CRC32C)
        .encode(&mut target);
    assert_eq!(res, Err(ser::Error::UnsupportedLegacyMode));

    let mut header = ser::BocHeader::with_root(cell.as_ref());
    header.add_root(Cell::empty_cell_ref());
    let res = header
        .with_tag(BocTag::IndexedCrc32)
        .with_mode(BocMode::WITH_INDEX | BocMode::WITH_CRC32C)
        .encode(&mut target);
    assert_eq!(res, Err(ser::Error::MultipleRootsNotSupported));
}

#[test]
fn deduplication() {
    let cell = shared_tree();

    let header = ser::BocHeader::with_root(cell.as_ref());
    assert_eq!(header.cell_count(), 3);

    // Same root twice is still one set of cells
    let mut header = ser::BocHeader::with_root(cell.as_ref());
    header.add_root(cell.as_ref());
    assert_eq!(header.cell_count(), 3);
    assert_eq!(header.root_count(), 2);

    let encoded = Boc::encode_pair((&cell, &cell));
    let (first, second) = Boc::decode_pair(&encoded).unwrap();
    assert_eq!(first.as_ref(), second.as_ref());
}

#[test]
fn cache_bits_mark_shared_cells() {
    let cell = shared_tree();
    let data =
        Boc::encode_ext(cell.as_ref(), BocMode::WITH_INDEX | BocMode::WITH_CACHE_BITS).unwrap();

    // has_index | has_cache_bits | ref_size
    assert_eq!(data[4], 0b1010_0001);
    // 6 + 3 refs + 1 total size + 1 root
    let index = &data[11..14];
    // Cumulative end offsets shifted by one, only the shared leaf is cached
    assert_eq!(index, &[6 << 1, 10 << 1, (16 << 1) | 1]);
}

#[test]
fn index_must_match_cells() {
    let cell = shared_tree();

    for mode in [
        BocMode::WITH_INDEX,
        BocMode::WITH_INDEX | BocMode::WITH_CACHE_BITS,
    ] {
        let data = Boc::encode_ext(cell.as_ref(), mode).unwrap();
        assert_eq!(Boc::decode(&data).unwrap().as_ref(), cell.as_ref());

        // 6 + 3 refs + 1 total size + 1 root
        let index_offset = 11;
        let shift = mode.contains(BocMode::WITH_CACHE_BITS) as u8;

        // Out of range offset
        let mut corrupted = data.clone();
        corrupted[index_offset] = 0xff;
        assert_eq!(Boc::decode(&corrupted), Err(de::Error::InvalidIndex));

        let lazy = LazyBoc::new(Bytes::from(corrupted)).unwrap();
        assert_eq!(lazy.get_root(0).unwrap_err(), de::Error::InvalidIndex);
        assert_eq!(lazy.mode().unwrap_err(), de::Error::InvalidIndex);

        // In range but not at the end of the first record
        let mut corrupted = data.clone();
        corrupted[index_offset] = 7 << shift;
        assert_eq!(Boc::decode(&corrupted), Err(de::Error::InvalidIndex));

        let lazy = LazyBoc::new(Bytes::from(corrupted)).unwrap();
        assert_eq!(lazy.get_root(0).unwrap_err(), de::Error::InvalidIndex);
    }
}

#[test]
fn trailing_bytes() {
    let cell = shared_tree();
    let mut data = Boc::encode_ext(cell.as_ref(), BocMode::WITH_CRC32C).unwrap();
    let boc_len = data.len();
    data.extend_from_slice(&[0, 1, 2]);

    assert_eq!(Boc::decode(&data), Err(de::Error::TrailingBytes));
    assert!(matches!(
        LazyBoc::new(Bytes::copy_from_slice(&data)),
        Err(de::Error::TrailingBytes)
    ));

    let options = de::Options {
        allow_trailing_bytes: true,
        ..Default::default()
    };
    let header = de::BocHeader::decode(&data, &options).unwrap();
    let cells = header.finalize(Cell::empty_context()).unwrap();
    assert_eq!(header.root(0, &cells).unwrap().as_ref(), cell.as_ref());

    let total_size = de::BocHeader::total_size(&data).unwrap() as usize;
    assert_eq!(total_size, boc_len);
    assert_eq!(Boc::decode(&data[..total_size]).unwrap().as_ref(), cell.as_ref());
}

#[test]
fn truncated_prefixes() {
    let cell = make_random_tree(3, 20);
    let data = Boc::encode_ext(cell.as_ref(), BocMode::WITH_INDEX | BocMode::WITH_CRC32C).unwrap();

    // 4 tag + 2 flags + 3 refs + total size
    let fixed_header_len = 6 + 3 + data[5] as usize;
    assert_eq!(
        de::BocHeader::total_size(&data[..fixed_header_len]).unwrap(),
        data.len() as u64
    );

    for len in 0..data.len() {
        let prefix = &data[..len];
        match Boc::decode(prefix) {
            Err(de::Error::NeedMoreBytes(n)) => {
                if len >= fixed_header_len {
                    assert_eq!(n, data.len() - len);
                } else {
                    assert!(n > 0 && len + n <= fixed_header_len);
                }
            }
            other => panic!("unexpected result for prefix {len}: {other:?}"),
        }
    }

    assert_eq!(Boc::decode(&data).unwrap().as_ref(), cell.as_ref());
}

#[test]
fn invalid_ref_order() {
    // Two cells where the second one references the first one
    let data = [
        0xb5, 0xee, 0x9c, 0x72, // tag
        0x01, 0x01, // ref_size=1, offset_size=1
        0x02, 0x01, 0x00, // cells, roots, absent
        0x05, // total cells size
        0x01, // root index
        0x00, 0x00, // cell 0: empty
        0x01, 0x00, 0x00, // cell 1: one reference to cell 0
    ];
    assert_eq!(Boc::decode(data), Err(de::Error::InvalidRefOrder));

    let lazy = LazyBoc::new(Bytes::copy_from_slice(&data)).unwrap();
    assert_eq!(lazy.get_root(0).unwrap_err(), de::Error::InvalidRefOrder);

    // Self reference
    let data = [
        0xb5, 0xee, 0x9c, 0x72, 0x01, 0x01, 0x01, 0x01, 0x00, 0x03, 0x00, //
        0x01, 0x00, 0x00,
    ];
    assert_eq!(Boc::decode(data), Err(de::Error::InvalidRefOrder));
}

#[test]
fn invalid_headers() {
    assert_eq!(
        Boc::decode([0xde, 0xad, 0xbe, 0xef, 0x01, 0x01]),
        Err(de::Error::UnknownBocTag)
    );

    // Cache bits without index
    assert_eq!(
        Boc::decode([0xb5, 0xee, 0x9c, 0x72, 0x21, 0x01]),
        Err(de::Error::InvalidHeader)
    );

    // Zero ref size
    assert_eq!(
        Boc::decode([0xb5, 0xee, 0x9c, 0x72, 0x00, 0x01]),
        Err(de::Error::InvalidRefSize)
    );

    // Total size is too small for the declared cells
    assert_eq!(
        Boc::decode([0xb5, 0xee, 0x9c, 0x72, 0x01, 0x01, 0x02, 0x01, 0x00, 0x01]),
        Err(de::Error::InvalidTotalSize)
    );
}

#[test]
fn stored_hashes_are_verified() {
    let cell = shared_tree();
    let mut data = Boc::encode_ext(cell.as_ref(), BocMode::WITH_TOP_HASH).unwrap();
    Boc::decode(&data).unwrap();

    // 10 bytes of header, 1 byte of root list, 2 bytes of descriptor
    assert_eq!(&data[13..45], cell.repr_hash().as_slice());
    data[13] ^= 0xff;
    assert_eq!(Boc::decode(&data), Err(de::Error::InvalidCell));
}

#[test]
fn lazy_matches_eager() {
    let data = decode_base64(CONTRACT_BOC).unwrap();
    let eager = Boc::decode(&data).unwrap();

    let lazy = LazyBoc::new(Bytes::from(data)).unwrap();
    assert_eq!(lazy.loaded_count(), 0);

    let root = lazy.get_root(0).unwrap();
    assert_eq!(root.repr_hash(), eager.repr_hash());
    assert_eq!(root.repr_depth(), eager.repr_depth());
    assert_eq!(lazy.loaded_count(), lazy.cell_count());
}

#[test]
fn base64_helpers() {
    let cell = shared_tree();
    let encoded = Boc::encode_base64(&cell);
    let decoded = Boc::decode_base64(&encoded).unwrap();
    assert_eq!(decoded.as_ref(), cell.as_ref());
    assert_eq!(Boc::decode_base64("@@@"), Err(de::Error::UnknownBocTag));
}

#[cfg(feature = "serde")]
#[derive(::serde::Serialize, ::serde::Deserialize)]
struct SerdeWithHashBytes {
    some_hash: HashBytes,
}

#[cfg(feature = "serde")]
#[derive(::serde::Serialize, ::serde::Deserialize)]
struct SerdeWithCellContainer {
    #[serde(with = "Boc")]
    some_cell: Cell,
}

#[cfg(feature = "serde")]
#[test]
fn hex_bytes() {
    let hash = HashBytes(rand::random());

    let test = format!(r#"{{"some_hash":"{hash}"}}"#);
    let SerdeWithHashBytes { some_hash } = serde_json::from_str(&test).unwrap();
    assert_eq!(some_hash, hash);

    let serialized = serde_json::to_string(&SerdeWithHashBytes { some_hash }).unwrap();
    assert_eq!(serialized, test);
}

#[cfg(feature = "serde")]
#[test]
fn struct_with_cell() {
    let boc = "te6ccgEBAQEAWwAAsUgBUkKKaORs1v/d2CpkdS1rueLjL5EbgaivG/SlIBcUZ5cAKkhRTRyNmt/7uwVMjqWtdzxcZfIjcDUV436UpALijPLQ7msoAAYUWGAAAD6o4PtmhMeK8nJA";

    let test = format!(r#"{{"some_cell":"{boc}"}}"#);
    let SerdeWithCellContainer { some_cell } = serde_json::from_str(&test).unwrap();

    let original = Boc::decode_base64(boc).unwrap();
    assert_eq!(some_cell.as_ref(), original.as_ref());

    let serialized = serde_json::to_string(&SerdeWithCellContainer { some_cell }).unwrap();
    assert_eq!(serialized, test);
}
