// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

/// One mebibyte.
pub const MIB: u64 = 1 << 20;
/// One gibibyte.
pub const GIB: u64 = 1 << 30;
/// First address above the 32-bit physical address space.
pub const FOUR_GIB: u64 = 4 * GIB;

/// Converts MiB to bytes
pub const fn mib_to_bytes(mib: u64) -> u64 {
    mib << 20
}

/// Converts bytes to MiB, truncating any remainder
pub const fn bytes_to_mib(bytes: u64) -> u64 {
    bytes >> 20
}

/// Serde helpers for numbers that are conventionally written in hexadecimal.
///
/// Deserialization accepts either a plain JSON number or a string with an optional `0x` prefix;
/// serialization always produces a `0x`-prefixed lowercase string.
pub mod hex {
    use std::fmt::{self, LowerHex};
    use std::marker::PhantomData;

    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    /// Parses a hexadecimal string with an optional `0x`/`0X` prefix.
    pub fn parse(value: &str) -> Result<u64, std::num::ParseIntError> {
        let digits = value
            .strip_prefix("0x")
            .or_else(|| value.strip_prefix("0X"))
            .unwrap_or(value);
        u64::from_str_radix(digits, 16)
    }

    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: LowerHex,
        S: Serializer,
    {
        serializer.collect_str(&format_args!("{value:#x}"))
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: TryFrom<u64>,
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(HexVisitor(PhantomData))
    }

    struct HexVisitor<T>(PhantomData<T>);

    impl<T: TryFrom<u64>> HexVisitor<T> {
        fn narrow<E: de::Error>(value: u64) -> Result<T, E> {
            T::try_from(value).map_err(|_| E::custom(format!("{value:#x} is out of range")))
        }
    }

    impl<T: TryFrom<u64>> Visitor<'_> for HexVisitor<T> {
        type Value = T;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("an unsigned integer or a hexadecimal string")
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<T, E> {
            Self::narrow(value)
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<T, E> {
            let value = parse(value).map_err(|err| E::custom(format!("{value:?}: {err}")))?;
            Self::narrow(value)
        }
    }

    /// Same as the parent module, for optional fields.
    pub mod option {
        use std::fmt::LowerHex;

        use serde::{Deserialize, Deserializer, Serializer};

        #[derive(Deserialize)]
        #[serde(bound(deserialize = "T: TryFrom<u64>"))]
        struct Wrapper<T: TryFrom<u64>>(#[serde(deserialize_with = "super::deserialize")] T);

        pub fn serialize<T, S>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
        where
            T: LowerHex,
            S: Serializer,
        {
            match value {
                Some(value) => super::serialize(value, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
        where
            T: TryFrom<u64>,
            D: Deserializer<'de>,
        {
            Ok(Option::<Wrapper<T>>::deserialize(deserializer)?.map(|Wrapper(value)| value))
        }
    }
}
