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

#![allow(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![deny(clippy::undocumented_unsafe_blocks)]

use std::io::{Write, stdout};
use std::os::unix::ffi::OsStrExt;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use bytes::{BufMut, Bytes, BytesMut};

#[cfg(feature = "gperf")]
use gperftools::{HEAP_PROFILER, PROFILER};

use proeval::eval::{Evaluator, LoadFlags, VisitReturn};
use proeval::file_cache::ProFileCache;
use proeval::flags::FLAGS;
use proeval::globals::{CmdLineState, Globals};
use proeval::handler::{EvalFileType, MessageHandler, StderrHandler};
use proeval::parser::{ParseFlags, QmakeParser, dump_tokens};
use proeval::proitem::{ProKey, ProStringList};
use proeval::strutil::{dirname, quote_value, resolve_path};
use proeval::vfs::Vfs;
use proeval::{log, log_stat};

#[cfg(all(feature = "jemalloc", not(feature = "gperf"), target_os = "linux"))]
use tikv_jemallocator::Jemalloc;

// Use jemalloc for better performance, but gperftools will use tcmalloc for
// heap debugging.
#[cfg(all(feature = "jemalloc", not(feature = "gperf"), target_os = "linux"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn build_globals(pwd: &Bytes, project_dir: &[u8], out_dir: &[u8]) -> Result<Globals> {
    let mut globals = Globals::new();
    let mut state = CmdLineState {
        pwd: pwd.clone(),
        ..Default::default()
    };
    globals.add_command_line_arguments(&mut state, &FLAGS.qmake_args)?;
    globals.commit_command_line_arguments(&mut state);
    for (name, value) in &FLAGS.properties {
        globals.set_property(name, value);
    }
    globals.debug_level = FLAGS.debug_level;
    if let Ok(exe) = std::env::current_exe() {
        globals.qmake_abslocation = Bytes::copy_from_slice(exe.as_os_str().as_bytes());
    }
    globals.set_directories(project_dir, out_dir);
    Ok(globals)
}

fn format_variable(name: &ProKey, values: &ProStringList) -> Bytes {
    let mut line = BytesMut::new();
    line.put_slice(name.as_bytes());
    line.put_slice(b" =");
    for value in values {
        line.put_u8(b' ');
        line.put_slice(&quote_value(value.as_bytes()));
    }
    line.put_u8(b'\n');
    line.freeze()
}

fn dump_variables(ev: &Evaluator) -> Result<()> {
    let mut out = stdout().lock();
    if FLAGS.dump_vars.is_empty() {
        for (name, values) in ev.variables() {
            // Names starting with a dot are internal.
            if name.starts_with(b".") {
                continue;
            }
            out.write_all(&format_variable(&name, &values))?;
        }
    } else {
        for name in &FLAGS.dump_vars {
            let name = ProKey::new(name.clone());
            out.write_all(&format_variable(&name, &ev.values(&name)))?;
        }
    }
    out.flush()?;
    Ok(())
}

fn run() -> Result<i32> {
    let Some(project) = &FLAGS.project else {
        bail!("No project file specified.")
    };
    let cwd = std::env::current_dir().context("cannot get the current directory")?;
    let pwd = Bytes::copy_from_slice(cwd.as_os_str().as_bytes());
    let project = resolve_path(&pwd, project.as_bytes())?;

    let vfs = Arc::new(Vfs::new(true));
    let handler: Arc<dyn MessageHandler> = Arc::new(StderrHandler {
        verbose: FLAGS.debug_level > 0,
    });

    if FLAGS.dump_tokens {
        let parser = QmakeParser::new(None, vfs, handler);
        let flags = ParseFlags {
            use_cache: false,
            report_missing: true,
        };
        let Some(pro) = parser.parsed_pro_file(&project, flags) else {
            return Ok(1);
        };
        println!("{}", dump_tokens(&pro));
        return Ok(if pro.is_ok() { 0 } else { 1 });
    }

    let project_dir = dirname(&project);
    let out_dir = match &FLAGS.out_dir {
        Some(dir) => resolve_path(&pwd, dir.as_bytes())?,
        None => project_dir.clone(),
    };
    let globals = Arc::new(build_globals(&pwd, &project_dir, &out_dir)?);
    let parser = Arc::new(QmakeParser::new(
        Some(Arc::new(ProFileCache::new())),
        vfs.clone(),
        handler.clone(),
    ));
    let mut ev = Evaluator::new(globals.clone(), parser, vfs, handler);
    ev.set_cumulative(FLAGS.cumulative);
    ev.set_output_dir(out_dir);

    let start = std::time::Instant::now();
    let ret = ev.evaluate_file(&project, EvalFileType::Project, LoadFlags::ALL);
    log_stat!("eval time: {:.3}", start.elapsed().as_secs_f64());
    log!(
        "{} evaluated with {:?}",
        String::from_utf8_lossy(&project),
        ret
    );

    let code = match ret {
        VisitReturn::Error => 3,
        VisitReturn::False => 1,
        _ => {
            dump_variables(&ev)?;
            0
        }
    };
    drop(ev);
    globals.reset_base_envs();
    Ok(code)
}

fn main() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Warn)
        .format(|buf, record| {
            if let (Some(file), Some(line)) = (record.file(), record.line()) {
                writeln!(buf, "*proeval*: {file}:{line}: {}", record.args())
            } else {
                writeln!(buf, "*proeval*: {}", record.args())
            }
        })
        .parse_env("PROEVAL_LOG")
        .init();

    #[cfg(feature = "gperf")]
    {
        if let Some(path) = &FLAGS.cpu_profile_path {
            PROFILER
                .lock()
                .unwrap()
                .start(std::ffi::CString::new(path.as_bytes()).unwrap())
                .unwrap();
        }
        if let Some(path) = &FLAGS.memory_profile_path {
            HEAP_PROFILER
                .lock()
                .unwrap()
                .start(std::ffi::CString::new(path.as_bytes()).unwrap())
                .unwrap();
        }
    }

    let ret = match run() {
        Ok(ret) => ret,
        Err(err) => {
            for cause in err.chain() {
                eprintln!("{cause}");
            }
            1
        }
    };
    #[cfg(feature = "gperf")]
    {
        if FLAGS.cpu_profile_path.is_some() {
            PROFILER.lock().unwrap().stop().unwrap();
        }
        if FLAGS.memory_profile_path.is_some() {
            HEAP_PROFILER.lock().unwrap().stop().unwrap();
        }
    }
    proeval::stats::report_all_stats();
    std::process::exit(ret);
}
