//! Configuration types for simulated processes, using [serde].
//!
//! This module only checks that values are well formed; it does not verify
//! that paths exist or canonicalize them, so a configuration that parses on
//! one machine parses on every machine.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use umbra_time::simulation_time::SimulationTime;

/// How a process's system calls are redirected into the simulator: either a
/// ptrace supervisor traces the child, or a preloaded shared library
/// intercepts libc entry points.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterposeMethod {
    Ptrace,
    Preload,
}

impl FromStr for InterposeMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ptrace" => Ok(Self::Ptrace),
            "preload" => Ok(Self::Preload),
            other => Err(format!("unknown interpose method '{other}'")),
        }
    }
}

impl std::fmt::Display for InterposeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ptrace => write!(f, "ptrace"),
            Self::Preload => write!(f, "preload"),
        }
    }
}

/// Process arguments, either as a list or as a single string split on
/// whitespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProcessArgs {
    List(Vec<String>),
    Str(String),
}

impl ProcessArgs {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::List(args) => args.clone(),
            Self::Str(args) => args.split_whitespace().map(String::from).collect(),
        }
    }
}

fn default_args_empty() -> ProcessArgs {
    ProcessArgs::Str(String::new())
}

fn default_interpose_method() -> InterposeMethod {
    InterposeMethod::Preload
}

/// The name of an environment variable: non-empty and without `=`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct EnvName(String);

impl EnvName {
    pub fn new(name: impl Into<String>) -> Option<Self> {
        let name = name.into();
        if name.is_empty() || name.contains('=') {
            return None;
        }
        Some(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for EnvName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        EnvName::new(&name).ok_or_else(|| {
            serde::de::Error::custom(format!("invalid environment variable name '{name}'"))
        })
    }
}

/// A process to launch on a simulated host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessOptions {
    /// Path to the executable to run.
    pub path: PathBuf,

    /// Process arguments.
    #[serde(default = "default_args_empty")]
    pub args: ProcessArgs,

    /// Environment variables passed when executing this process.
    #[serde(default)]
    pub environment: BTreeMap<EnvName, String>,

    /// The simulated time at which to execute the process.
    #[serde(default, with = "simulation_time_serde")]
    pub start_time: SimulationTime,

    /// The simulated time at which to terminate the process, or absent to let
    /// it run until it exits on its own.
    #[serde(default, with = "simulation_time_serde::opt")]
    pub stop_time: Option<SimulationTime>,

    /// How this process's system calls are interposed.
    #[serde(default = "default_interpose_method")]
    pub interpose_method: InterposeMethod,
}

impl ProcessOptions {
    /// The executable name: the final component of the path.
    pub fn exe_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// The argument vector handed to exec; by convention argv[0] is the
    /// executable path.
    pub fn argv(&self) -> Vec<CString> {
        std::iter::once(self.path.to_string_lossy().into_owned())
            .chain(self.args.to_vec())
            .map(|arg| CString::new(arg).unwrap())
            .collect()
    }

    /// The environment vector handed to exec, rendered `NAME=value`.
    pub fn envv(&self) -> Vec<CString> {
        self.environment
            .iter()
            .map(|(name, value)| CString::new(format!("{}={}", name.as_str(), value)).unwrap())
            .collect()
    }
}

/// Serde glue for [`SimulationTime`]: accepts a bare integer (seconds) or a
/// string with a unit suffix ("2s", "10ms", ...), and serializes back to the
/// suffixed string form.
mod simulation_time_serde {
    use super::*;

    struct TimeVisitor;

    impl serde::de::Visitor<'_> for TimeVisitor {
        type Value = SimulationTime;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a number of seconds or a string such as '10ms'")
        }

        fn visit_u64<E: serde::de::Error>(self, secs: u64) -> Result<Self::Value, E> {
            SimulationTime::try_from_secs(secs)
                .ok_or_else(|| E::custom(format!("time value '{secs}' is out of range")))
        }

        fn visit_i64<E: serde::de::Error>(self, secs: i64) -> Result<Self::Value, E> {
            let secs: u64 = secs
                .try_into()
                .map_err(|_| E::custom("time values must not be negative"))?;
            self.visit_u64(secs)
        }

        fn visit_str<E: serde::de::Error>(self, s: &str) -> Result<Self::Value, E> {
            s.parse().map_err(E::custom)
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SimulationTime, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_any(TimeVisitor)
    }

    pub fn serialize<S>(time: &SimulationTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&time.to_string())
    }

    pub mod opt {
        use super::*;

        #[derive(Deserialize)]
        struct Wrapper(#[serde(with = "super::super::simulation_time_serde")] SimulationTime);

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<SimulationTime>, D::Error>
        where
            D: serde::Deserializer<'de>,
        {
            let wrapper: Option<Wrapper> = Option::deserialize(deserializer)?;
            Ok(wrapper.map(|w| w.0))
        }

        pub fn serialize<S>(
            time: &Option<SimulationTime>,
            serializer: S,
        ) -> Result<S::Ok, S::Error>
        where
            S: serde::Serializer,
        {
            match time {
                Some(time) => serializer.serialize_some(&time.to_string()),
                None => serializer.serialize_none(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_process_options() {
        let yaml = "
            path: /usr/bin/curl
            args: -s example.com
            environment:
              HOME: /tmp
            start_time: 10ms
            stop_time: 2s
            interpose_method: ptrace
        ";
        let options: ProcessOptions = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(options.exe_name(), "curl");
        assert_eq!(options.start_time, SimulationTime::from_millis(10));
        assert_eq!(options.stop_time, Some(SimulationTime::from_secs(2)));
        assert_eq!(options.interpose_method, InterposeMethod::Ptrace);
        assert_eq!(
            options.argv(),
            vec![
                CString::new("/usr/bin/curl").unwrap(),
                CString::new("-s").unwrap(),
                CString::new("example.com").unwrap(),
            ]
        );
        assert_eq!(options.envv(), vec![CString::new("HOME=/tmp").unwrap()]);
    }

    #[test]
    fn test_defaults() {
        let options: ProcessOptions = serde_yaml::from_str("path: /bin/sleep").unwrap();
        assert_eq!(options.start_time, SimulationTime::ZERO);
        assert_eq!(options.stop_time, None);
        assert_eq!(options.interpose_method, InterposeMethod::Preload);
        assert_eq!(options.argv(), vec![CString::new("/bin/sleep").unwrap()]);
        assert!(options.envv().is_empty());
    }

    #[test]
    fn test_args_as_list() {
        let options: ProcessOptions =
            serde_yaml::from_str("{path: /bin/echo, args: [hello, world]}").unwrap();
        assert_eq!(options.args.to_vec(), vec!["hello", "world"]);
    }

    #[test]
    fn test_bare_seconds() {
        let options: ProcessOptions =
            serde_yaml::from_str("{path: /bin/true, start_time: 5}").unwrap();
        assert_eq!(options.start_time, SimulationTime::from_secs(5));
    }

    #[test]
    fn test_rejects_bad_env_name() {
        assert!(serde_yaml::from_str::<ProcessOptions>(
            "{path: /bin/true, environment: {'A=B': c}}"
        )
        .is_err());
        assert!(EnvName::new("PATH").is_some());
        assert!(EnvName::new("").is_none());
    }
}
