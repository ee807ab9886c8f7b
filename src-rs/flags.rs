/*
Copyright 2025 Google LLC

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

     https://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::{
    env,
    ffi::{OsStr, OsString},
    os::unix::ffi::{OsStrExt, OsStringExt},
    sync::LazyLock,
    vec::IntoIter,
};

use bytes::Bytes;

pub static FLAGS: LazyLock<Flags> = LazyLock::new(|| {
    if cfg!(test) {
        Flags::default()
    } else {
        Flags::from_args(env::args_os().collect())
    }
});

#[derive(Default)]
pub struct Flags {
    pub enable_stat_logs: bool,
    pub color_warnings: bool,
    pub cumulative: bool,
    pub dump_tokens: bool,
    /// Number of `-d` flags.
    pub debug_level: i32,
    pub out_dir: Option<OsString>,
    pub properties: Vec<(Bytes, Bytes)>,
    /// Only these variables are printed when non-empty.
    pub dump_vars: Vec<Bytes>,
    /// Arguments in qmake syntax, handed to `Globals`.
    pub qmake_args: Vec<Bytes>,
    pub project: Option<OsString>,

    pub cpu_profile_path: Option<OsString>,
    pub memory_profile_path: Option<OsString>,
}

fn parse_command_line_option_with_arg(
    option: &str,
    arg: &OsStr,
    args: &mut IntoIter<OsString>,
) -> Option<OsString> {
    let arg = arg.as_bytes();
    let arg = arg.strip_prefix(option.as_bytes())?;
    if arg.is_empty() {
        return args.next();
    }
    if let Some(arg) = arg.strip_prefix(b"=") {
        return Some(OsString::from_vec(arg.to_vec()));
    }
    None
}

fn to_bytes(arg: &OsStr) -> Bytes {
    Bytes::copy_from_slice(arg.as_bytes())
}

impl Flags {
    fn from_args(args: Vec<OsString>) -> Flags {
        let mut iter = args.into_iter();
        let mut flags = Flags::default();
        iter.next();

        while let Some(arg) = iter.next() {
            match arg.as_bytes() {
                b"-d" => flags.debug_level += 1,
                b"--stats" => flags.enable_stat_logs = true,
                b"--color_warnings" => flags.color_warnings = true,
                b"--cumulative" => flags.cumulative = true,
                b"--dump_tokens" => flags.dump_tokens = true,
                b"-after" | b"-nocache" | b"-win32" | b"-unix" => {
                    flags.qmake_args.push(to_bytes(&arg))
                }
                b"-spec" | b"-platform" | b"-xspec" | b"-xplatform" | b"-t" | b"-template"
                | b"-tp" | b"-template_prefix" | b"-config" | b"-cache" => {
                    let Some(value) = iter.next() else {
                        panic!("Missing value for {}", arg.to_string_lossy());
                    };
                    flags.qmake_args.push(to_bytes(&arg));
                    flags.qmake_args.push(to_bytes(&value));
                }
                _ => {
                    if let Some(arg) = parse_command_line_option_with_arg("-o", &arg, &mut iter) {
                        flags.out_dir = Some(arg);
                    } else if let Some(arg) =
                        parse_command_line_option_with_arg("--dump", &arg, &mut iter)
                    {
                        flags.dump_vars.push(to_bytes(&arg));
                    } else if let Some(arg) =
                        parse_command_line_option_with_arg("--property", &arg, &mut iter)
                    {
                        let arg = arg.as_bytes();
                        let Some(eq) = arg.iter().position(|c| *c == b'=') else {
                            panic!(
                                "Invalid --property flag: {}",
                                String::from_utf8_lossy(arg)
                            );
                        };
                        flags.properties.push((
                            Bytes::copy_from_slice(&arg[..eq]),
                            Bytes::copy_from_slice(&arg[eq + 1..]),
                        ));
                    } else if let Some(arg) =
                        parse_command_line_option_with_arg("--cpu_profile", &arg, &mut iter)
                    {
                        flags.cpu_profile_path = Some(arg)
                    } else if let Some(arg) =
                        parse_command_line_option_with_arg("--mem_profile", &arg, &mut iter)
                    {
                        flags.memory_profile_path = Some(arg)
                    } else if arg.as_bytes().starts_with(b"-") {
                        panic!("Unknown flag: {}", arg.to_string_lossy());
                    } else if arg.as_bytes().contains(&b'=') {
                        flags.qmake_args.push(to_bytes(&arg));
                    } else if flags.project.is_some() {
                        panic!("Unexpected argument: {}", arg.to_string_lossy());
                    } else {
                        flags.project = Some(arg);
                    }
                }
            }
        }

        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Flags {
        Flags::from_args(args.iter().map(|s| s.into()).collect())
    }

    #[test]
    fn test_flags() {
        let flags = parse(&[
            "proeval",
            "-spec",
            "linux-g++",
            "CONFIG+=debug",
            "-after",
            "A=1",
            "-d",
            "-d",
            "--dump",
            "SOURCES",
            "--dump=HEADERS",
            "--property",
            "QT_INSTALL_PREFIX=/usr",
            "-o",
            "out",
            "app.pro",
        ]);
        assert_eq!(flags.project.as_deref(), Some(OsStr::new("app.pro")));
        assert_eq!(flags.out_dir.as_deref(), Some(OsStr::new("out")));
        assert_eq!(flags.debug_level, 2);
        assert_eq!(flags.dump_vars, ["SOURCES", "HEADERS"]);
        assert_eq!(
            flags.properties,
            [(Bytes::from("QT_INSTALL_PREFIX"), Bytes::from("/usr"))]
        );
        assert_eq!(
            flags.qmake_args,
            ["-spec", "linux-g++", "CONFIG+=debug", "-after", "A=1"]
        );
    }

    #[test]
    #[should_panic(expected = "Unknown flag: --bogus")]
    fn test_unknown_flag() {
        parse(&["proeval", "--bogus"]);
    }

    #[test]
    fn test_parse_command_line_option_with_arg() {
        assert_eq!(
            parse_command_line_option_with_arg(
                "--dump",
                &OsString::from("--dump=TARGET"),
                &mut vec![].into_iter()
            ),
            Some(OsString::from("TARGET"))
        );
        assert_eq!(
            parse_command_line_option_with_arg(
                "--dump",
                &OsString::from("--dump_tokens"),
                &mut vec![].into_iter()
            ),
            None
        );
    }
}
