//! Validated newtypes with good serde serialisation/deserialisation
//! support, i.e. made explicitly for representations usable in the
//! config file and in report data files. They also support `FromStr`,
//! and are thus usable with the `clap` command line parser.

pub mod git_hash;
pub mod repo_slug;
