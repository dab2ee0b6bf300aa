#[cfg(feature = "fips")]
extern crate boring;
extern crate byteorder;
extern crate gethostname;
extern crate hmac;
extern crate indexmap;
extern crate log;
extern crate md4;
extern crate md5;
extern crate num_bigint;
extern crate num_enum;
extern crate oid_registry;
extern crate rand;
extern crate rc4;
extern crate ring;
extern crate rsa;
extern crate x509_parser;
extern crate yasna;

#[macro_use]
pub mod model;
pub mod core;
pub mod nla;
