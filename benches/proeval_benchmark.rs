use std::sync::Arc;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use proeval::handler::CollectingHandler;
use proeval::parser::{Grammar, QmakeParser};
use proeval::strutil::split_value_list;
use proeval::vfs::Vfs;

const PROJECT: &str = r#"TEMPLATE = app
TARGET = demo
QT += core gui widgets
CONFIG += c++17 warn_on
SOURCES += main.cpp \
    window.cpp \
    "path with spaces/model.cpp"
HEADERS += window.h model.h
win32 {
    LIBS += -luser32
} else:unix:!macx {
    LIBS += -lm -ldl
}
for(f, SOURCES): OBJECTS += $$replace(f, \.cpp$, .o)
defineTest(check) {
    contains(CONFIG, $$1): return(true)
    return(false)
}
"#;

fn criterion_benchmark(c: &mut Criterion) {
    let parser = QmakeParser::new(
        None,
        Arc::new(Vfs::new(false)),
        Arc::new(CollectingHandler::new()),
    );
    let text = PROJECT.repeat(200);
    c.bench_function("parse", |b| {
        b.iter(|| {
            black_box(parser.parsed_pro_block(
                black_box(text.as_bytes()),
                b"bench.pro",
                1,
                Grammar::Full,
            ))
        })
    });

    let list = "-DFOO=1 \"-DBAR=a b\" -I/usr/include 'single quoted' ".repeat(5000);
    c.bench_function("split_value_list", |b| {
        b.iter(|| black_box(split_value_list(black_box(list.as_bytes()))))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
