use criterion::{criterion_group, criterion_main, Criterion};
use drmhwc::backend::allocator::Fourcc;
use drmhwc::backend::drm::{CrtcId, CrtcInfo, Layer, PlaneId, PlaneInfo, PlaneType, Planner};
use rand::Rng;

const FORMATS: [Fourcc; 3] = [Fourcc::Argb8888, Fourcc::Xrgb8888, Fourcc::Nv12];

fn plane(id: u32, kind: PlaneType, formats: &[Fourcc]) -> PlaneInfo {
    PlaneInfo {
        id: PlaneId(id),
        kind,
        possible_crtcs: 0b1,
        formats: formats.iter().copied().collect(),
    }
}

fn criterion_benchmark(c: &mut Criterion) {
    let crtc = CrtcInfo {
        id: CrtcId(1),
        index: 0,
        display: None,
    };
    let primary = vec![plane(10, PlaneType::Primary, &FORMATS[..2])];
    let overlay = (0..6)
        .map(|idx| plane(20 + idx, PlaneType::Overlay, &FORMATS[(idx as usize % 2)..]))
        .collect::<Vec<_>>();

    let mut rand = rand::thread_rng();
    let layers = (0..16)
        .map(|_| {
            let format = FORMATS[rand.gen_range(0..FORMATS.len())];
            if rand.gen_bool(0.1) {
                Layer::protected(format)
            } else {
                Layer::new(format)
            }
        })
        .collect::<Vec<_>>();

    let planner = Planner::default();
    c.bench_function("assign_planes", |b| {
        b.iter(|| {
            let _ = planner.assign_planes(&layers, &crtc, &primary, &overlay);
        });
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
