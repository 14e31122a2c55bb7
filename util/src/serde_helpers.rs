use std::path::Path;

use anyhow::Result;
use serde::de::{Error, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub fn load_json_from_file<T, P>(path: P) -> Result<T>
where
    for<'de> T: Deserialize<'de>,
    P: AsRef<Path>,
{
    let data = std::fs::read_to_string(path)?;
    let de = &mut serde_json::Deserializer::from_str(&data);
    serde_path_to_error::deserialize(de).map_err(Into::into)
}

/// Human readable durations (`"10s"`, `"1m 30s"`).
pub mod humantime {
    use std::time::Duration;

    use super::*;

    pub fn serialize<T, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        for<'a> Serde<&'a T>: Serialize,
    {
        Serde::from(value).serialize(serializer)
    }

    pub fn deserialize<'a, T, D: Deserializer<'a>>(deserializer: D) -> Result<T, D::Error>
    where
        Serde<T>: Deserialize<'a>,
    {
        Serde::deserialize(deserializer).map(Serde::into_inner)
    }

    pub struct Serde<T>(T);

    impl<T> Serde<T> {
        #[inline]
        pub fn into_inner(self) -> T {
            self.0
        }
    }

    impl<T> From<T> for Serde<T> {
        fn from(value: T) -> Serde<T> {
            Serde(value)
        }
    }

    impl<'de> Deserialize<'de> for Serde<Duration> {
        fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Serde<Duration>, D::Error> {
            struct DurationVisitor;

            impl Visitor<'_> for DurationVisitor {
                type Value = Duration;

                fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    f.write_str("a human readable duration")
                }

                fn visit_str<E: Error>(self, v: &str) -> Result<Duration, E> {
                    ::humantime::parse_duration(v)
                        .map_err(|_e| E::invalid_value(serde::de::Unexpected::Str(v), &self))
                }
            }

            d.deserialize_str(DurationVisitor).map(Serde)
        }
    }

    impl Serialize for Serde<&Duration> {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.collect_str(&::humantime::format_duration(*self.0))
        }
    }
}
