use crate::util::constants::{LOG_BYTES_IN_KBYTE, LOG_BYTES_IN_MBYTE};
use regex::Regex;
use std::default::Default;
use std::str::FromStr;

/// The default size of a heap region.
pub const DEFAULT_REGION_SIZE: usize = 1 << LOG_BYTES_IN_MBYTE;
/// The smallest supported region size.
pub const MIN_REGION_SIZE: usize = 256 << LOG_BYTES_IN_KBYTE;
/// The largest supported region size. Card indices within a region are 16 bit,
/// which caps a region at 1 << (16 + LOG_BYTES_IN_CARD) bytes.
pub const MAX_REGION_SIZE: usize = 32 << LOG_BYTES_IN_MBYTE;
/// The number of entries a fresh sparse remembered set table starts with.
pub const DEFAULT_SPARSE_INITIAL_CAPACITY: usize = 16;

/// A byte size given either as a plain number of bytes or with a `k`/`m`
/// suffix, e.g. `4096`, `512k`, `1m`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HumanSize(pub usize);

impl HumanSize {
    pub const fn bytes(self) -> usize {
        self.0
    }
}

lazy_static! {
    static ref SIZE_REGEX: Regex = Regex::new(r"^(\d+)\s*([kKmM]?)$").unwrap();
}

impl FromStr for HumanSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let captures = SIZE_REGEX
            .captures(s.trim())
            .ok_or_else(|| format!("Cannot parse size: {:?}", s))?;
        let number: usize = captures[1]
            .parse()
            .map_err(|_| format!("Cannot parse size: {:?}", s))?;
        let shift = match &captures[2] {
            "" => 0,
            "k" | "K" => LOG_BYTES_IN_KBYTE,
            "m" | "M" => LOG_BYTES_IN_MBYTE,
            _ => unreachable!(),
        };
        Ok(HumanSize(number << shift))
    }
}

fn always_valid<T>(_: &T) -> bool {
    true
}

macro_rules! options {
    ($($name:ident: $type:ty[$validator:expr] = $default:expr),*,) => [
        options!($($name: $type[$validator] = $default),*);
    ];
    ($($name:ident: $type:ty[$validator:expr] = $default:expr),*) => [
        pub struct Options {
            $(pub $name: $type),*
        }
        impl Options {
            pub fn set_from_str(&mut self, s: &str, val: &str)->bool {
                match s {
                    // Parse the given value from str (by env vars or by calling set_from_camelcase_str()) to the right type
                    $(stringify!($name) => if let Ok(ref val) = val.parse::<$type>() {
                        // Validate
                        let validate_fn = $validator;
                        let is_valid = validate_fn(val);
                        if is_valid {
                            // Only set value if valid.
                            self.$name = val.clone();
                        } else {
                            eprintln!("Warn: unable to set {}={:?}. Invalid value. Default value will be used.", s, val);
                        }
                        is_valid
                    } else {
                        eprintln!("Warn: unable to set {}={:?}. Cant parse value. Default value will be used.", s, val);
                        false
                    })*
                    _ => panic!("Invalid Options key")
                }
            }
        }
        impl Default for Options {
            fn default() -> Self {
                let mut options = Options {
                    $($name: $default),*
                };

                // If we have env vars that start with REGIONGC_ and match any option
                // (such as REGIONGC_REGION_SIZE), we set the option to its value (if
                // it is a valid value). Otherwise, use the default value.
                const PREFIX: &str = "REGIONGC_";
                for (key, val) in std::env::vars() {
                    // strip the prefix, and get the lower case string
                    if let Some(rest_of_key) = key.strip_prefix(PREFIX) {
                        let lowercase: &str = &rest_of_key.to_lowercase();
                        match lowercase {
                            $(stringify!($name) => { options.set_from_str(lowercase, &val); },)*
                            _ => {}
                        }
                    }
                }
                return options;
            }
        }
    ]
}
options! {
    // The size of each heap region. Must be a power of two between 256k and 32m.
    region_size:             HumanSize [|v: &HumanSize| v.bytes().is_power_of_two()
                                        && v.bytes() >= MIN_REGION_SIZE
                                        && v.bytes() <= MAX_REGION_SIZE] = HumanSize(DEFAULT_REGION_SIZE),
    // The entry capacity a sparse remembered set table starts with, and is reset to by clear().
    sparse_initial_capacity: usize     [|v: &usize| v.is_power_of_two()] = DEFAULT_SPARSE_INITIAL_CAPACITY,
    // Walk and verify the young region lists after operations that rebuild them.
    verify_region_lists:     bool      [always_valid] = false,
}

impl Options {
    pub fn set_from_camelcase_str(&mut self, s: &str, val: &str) -> bool {
        trace!("Trying to process option pair: ({}, {})", s, val);

        let mut sr = String::with_capacity(s.len());
        for c in s.chars() {
            if c.is_uppercase() {
                sr.push('_');
                for c in c.to_lowercase() {
                    sr.push(c);
                }
            } else {
                sr.push(c)
            }
        }

        let result = self.set_from_str(sr.as_str(), val);

        if result {
            trace!("Validation passed");
        } else {
            trace!("Validation failed")
        }
        result
    }
}
