//! Turns a `ProcessDescription` into a command line and environment.
//!
//! Properties are grouped by prefix: `env.NAME` sets an environment
//! variable, `java.*` configures a JVM-style launcher, and anything else
//! becomes a `-Dname=value` system property. A doubled prefix
//! (`env.env.x`, `java.java.x`) is a system property too. When neither
//! launcher nor system properties are present the command line is just the
//! description's arguments, so any program can be started.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::warn;

use node_agent_common::NodeError::InvalidArgument;
use node_agent_common::{NodeError, ProcessDescription};

const JVM_MODES: [&str; 4] = ["classic", "hotspot", "client", "server"];
const BOOT_CLASS_PATH: &str = "Xbootclasspath";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub argv: Vec<String>,
    /// Overrides layered on the host's inherited environment.
    pub env: Vec<(String, String)>,
}

#[derive(Default)]
struct Groups {
    env: BTreeMap<String, String>,
    java: BTreeMap<String, String>,
    sys: BTreeMap<String, String>,
}

fn group_properties(
    description: &ProcessDescription,
    defaults: &BTreeMap<String, String>,
) -> Result<Groups, NodeError> {
    let mut all: BTreeMap<&str, Option<&str>> = defaults
        .iter()
        .map(|(k, v)| (k.as_str(), Some(v.as_str())))
        .collect();
    for (k, v) in description.properties() {
        all.insert(k.as_str(), v.as_deref());
    }

    let mut groups = Groups::default();
    for (name, value) in all {
        // `None` erases a default
        let Some(value) = value else { continue };
        let name = name.trim();
        let value = value.trim();
        if let Some(ch) = value.chars().find(|c| c.is_whitespace()) {
            return Err(InvalidArgument(format!(
                "Property name \"{}\" contains illegal whitespace ({}) in value: \"{}\"",
                name, ch as u32, value
            )));
        }
        if let Some(rest) = name.strip_prefix("env.") {
            if !rest.starts_with("env.") {
                groups.env.insert(rest.to_string(), value.to_string());
                continue;
            }
            groups.sys.insert(rest.to_string(), value.to_string());
        } else if let Some(rest) = name.strip_prefix("java.") {
            if !rest.starts_with("java.") {
                groups.java.insert(rest.to_string(), value.to_string());
                continue;
            }
            groups.sys.insert(rest.to_string(), value.to_string());
        } else {
            groups.sys.insert(name.to_string(), value.to_string());
        }
    }
    Ok(groups)
}

fn non_empty(name: &str, value: String) -> Result<String, NodeError> {
    if value.is_empty() {
        return Err(InvalidArgument(format!("\"{}\" must be non-empty", name)));
    }
    Ok(value)
}

fn default_jvm_program() -> String {
    match std::env::var_os("JAVA_HOME") {
        Some(home) => PathBuf::from(home)
            .join("bin")
            .join("java")
            .to_string_lossy()
            .into_owned(),
        None => "java".to_string(),
    }
}

fn flag(prefix: &str, name: &str, value: &str) -> String {
    if value.is_empty() {
        format!("{}{}", prefix, name)
    } else {
        format!("{}{}={}", prefix, name, value)
    }
}

fn jvm_command(
    mut java: BTreeMap<String, String>,
    sys: BTreeMap<String, String>,
) -> Result<Vec<String>, NodeError> {
    let mut argv = vec![java.remove("jvm.program").unwrap_or_else(default_jvm_program)];

    let jar = java
        .remove("jar")
        .map(|jar| non_empty("java.jar", jar))
        .transpose()?;

    if let Some(mode) = java.remove("jvm.mode") {
        if !JVM_MODES.contains(&mode.as_str()) {
            return Err(InvalidArgument(format!("Illegal \"jvm.mode={}\"", mode)));
        }
        argv.push(format!("-{}", mode));
    }
    if java.remove("jvm.green").as_deref() == Some("true") {
        argv.push("-green".to_string());
    }

    if let Some(class_path) = java.remove("class.path") {
        if jar.is_none() {
            argv.push("-classpath".to_string());
            argv.push(non_empty("java.class.path", class_path)?);
        }
    }

    let boot_keys: Vec<String> = java
        .keys()
        .filter(|k| k.starts_with(BOOT_CLASS_PATH))
        .cloned()
        .collect();
    for key in boot_keys {
        let tail = &key[BOOT_CLASS_PATH.len()..];
        if !matches!(tail, "" | "/a" | "/p") {
            return Err(InvalidArgument(format!(
                "Expecting \"Xbootclasspath[|/a|/p]\", not \"{}\"",
                key
            )));
        }
        let value = java.remove(&key).unwrap_or_default();
        let value = non_empty(&key, value)?;
        argv.push(format!("-{}:{}", key, value));
    }

    for (key, option) in [("heap.min", "-Xms"), ("heap.max", "-Xmx"), ("stack.size", "-Xss")] {
        if let Some(value) = java.remove(key) {
            argv.push(format!("{}{}", option, non_empty(key, value)?));
        }
    }

    let class_name = java.remove("class.name");
    let main = match (&jar, class_name) {
        (Some(jar), class_name) => {
            if let Some(class_name) = class_name {
                warn!(jar = %jar, class = %class_name, "Ignoring class name, launching jar");
            }
            vec!["-jar".to_string(), jar.clone()]
        }
        (None, Some(class_name)) => vec![non_empty("java.class.name", class_name)?],
        (None, None) => {
            return Err(InvalidArgument(
                "Properties must specify a \"java.class.name\"".to_string(),
            ))
        }
    };

    argv.extend(java.iter().map(|(k, v)| flag("-", k, v)));
    argv.extend(sys.iter().map(|(k, v)| flag("-D", k, v)));
    argv.extend(main);
    Ok(argv)
}

/// Build the launch command, with `defaults` beneath the description's own
/// properties.
pub fn parse_description(
    description: &ProcessDescription,
    defaults: &BTreeMap<String, String>,
) -> Result<LaunchCommand, NodeError> {
    let Groups { env, java, sys } = group_properties(description, defaults)?;

    let mut argv = if java.is_empty() && sys.is_empty() {
        Vec::new()
    } else {
        jvm_command(java, sys)?
    };
    argv.extend(description.args().iter().cloned());

    if argv.is_empty() {
        return Err(InvalidArgument(format!(
            "{} has an empty command line",
            description
        )));
    }
    Ok(LaunchCommand {
        argv,
        env: env.into_iter().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc() -> ProcessDescription {
        ProcessDescription::new("node").unwrap()
    }

    fn no_defaults() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[test]
    fn test_plain_arguments() {
        let d = desc()
            .with_property("env.GREETING", "hi")
            .with_args(["/bin/sh", "-c", "echo $GREETING"]);
        let cmd = parse_description(&d, &no_defaults()).unwrap();
        assert_eq!(cmd.argv, vec!["/bin/sh", "-c", "echo $GREETING"]);
        assert_eq!(cmd.env, vec![("GREETING".to_string(), "hi".to_string())]);
    }

    #[test]
    fn test_empty_command_line() {
        let err = parse_description(&desc(), &no_defaults()).unwrap_err();
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_jvm_command() {
        let d = desc()
            .with_property("java.jvm.program", "/opt/jdk/bin/java")
            .with_property("java.class.path", "a.jar:b.jar")
            .with_property("java.heap.max", "64m")
            .with_property("java.jvm.mode", "server")
            .with_property("java.Xbootclasspath/p", "boot.jar")
            .with_property("java.class.name", "org.example.Main")
            .with_property("java.verbose", "")
            .with_property("org.example.id", "7")
            .with_args(["-c", "node.ini"]);
        let cmd = parse_description(&d, &no_defaults()).unwrap();
        assert_eq!(
            cmd.argv,
            vec![
                "/opt/jdk/bin/java",
                "-server",
                "-classpath",
                "a.jar:b.jar",
                "-Xbootclasspath/p:boot.jar",
                "-Xmx64m",
                "-verbose",
                "-Dorg.example.id=7",
                "org.example.Main",
                "-c",
                "node.ini",
            ]
        );
    }

    #[test]
    fn test_jar_ignores_class_name_and_class_path() {
        let d = desc()
            .with_property("java.jvm.program", "java")
            .with_property("java.jar", "app.jar")
            .with_property("java.class.path", "ignored")
            .with_property("java.class.name", "Ignored");
        let cmd = parse_description(&d, &no_defaults()).unwrap();
        assert_eq!(cmd.argv, vec!["java", "-jar", "app.jar"]);
    }

    #[test]
    fn test_defaults_merge_and_removal() {
        let mut defaults = BTreeMap::new();
        defaults.insert("java.jvm.program".to_string(), "java".to_string());
        defaults.insert("java.class.name".to_string(), "Main".to_string());
        defaults.insert("java.heap.max".to_string(), "1g".to_string());
        defaults.insert("env.HOME".to_string(), "/home/node".to_string());

        let d = desc()
            .with_property("java.heap.max", "2g")
            .without_property("env.HOME")
            .with_property("env.env.x", "1")
            .with_property("java.java.y", "2");
        let cmd = parse_description(&d, &defaults).unwrap();
        assert_eq!(cmd.argv, vec!["java", "-Xmx2g", "-Denv.x=1", "-Djava.y=2", "Main"]);
        assert!(cmd.env.is_empty());
    }

    #[test]
    fn test_rejects_bad_values() {
        let spaced = desc().with_property("x", "a b");
        assert!(parse_description(&spaced, &no_defaults()).is_err());

        let mode = desc()
            .with_property("java.class.name", "Main")
            .with_property("java.jvm.mode", "turbo");
        assert!(parse_description(&mode, &no_defaults()).is_err());

        let boot = desc()
            .with_property("java.class.name", "Main")
            .with_property("java.Xbootclasspath/z", "x");
        assert!(parse_description(&boot, &no_defaults()).is_err());

        let no_main = desc().with_property("java.heap.min", "1m");
        assert!(parse_description(&no_main, &no_defaults()).is_err());
    }
}
