use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use octopo::options::VolumeOptions;
use octopo::reduction::SerialReduction;
use octopo::simulation::{Evaluation, SimulationInterface};
use octopo::topology::Topology;
use octopo::update::OcUpdate;
use octopo::volume::{Sensitivities, VolumeEnforcer};
use octopo::Result;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, LogNormal};

struct UnitCells(usize);

impl SimulationInterface for UnitCells {
    fn num_opt_dofs(&self) -> usize {
        self.0
    }

    fn initialize_topology(&mut self, _densities: &[f64]) -> Result<()> {
        Ok(())
    }

    fn total_volume(&mut self) -> Result<f64> {
        Ok(self.0 as f64)
    }

    fn compute_volume(&mut self, densities: &[f64]) -> Result<f64> {
        Ok(densities.iter().sum())
    }

    fn compute_volume_with_gradient(&mut self, densities: &[f64], gradient: &mut [f64]) -> Result<f64> {
        gradient.fill(1.0);
        Ok(densities.iter().sum())
    }

    fn compute(&mut self, _densities: &[f64], gradient: &mut [f64]) -> Result<Evaluation> {
        gradient.fill(-1.0);
        Ok(Evaluation::objective_only(0.0))
    }
}

fn bench_enforce(c: &mut Criterion) {
    let topology = Topology::new(0.001, 1.0, 0.5).expect("valid bounds");
    let rule = OcUpdate::new(&topology, 0.5, 0.2);
    let mut group = c.benchmark_group("enforce");

    for &n in &[1_000usize, 100_000] {
        let mut rng = SmallRng::seed_from_u64(42);
        let sensitivity = LogNormal::new(0.0, 1.0).expect("valid distribution");
        let p_last: Vec<f64> = (0..n).map(|_| rng.gen_range(0.2..0.8)).collect();
        let dfdp: Vec<f64> = (0..n).map(|_| -sensitivity.sample(&mut rng)).collect();
        let dvdp = vec![1.0; n];

        for newton in [false, true] {
            let options = VolumeOptions::new(0.4, 1e-8, 80).with_newton_search(newton);
            let enforcer = VolumeEnforcer::new(rule, &options);
            let label = if newton { "newton" } else { "bisection" };
            let mut p = vec![0.0; n];
            let mut simulation = UnitCells(n);

            group.bench_with_input(BenchmarkId::new(label, n), &n, |b, &n| {
                b.iter(|| {
                    enforcer
                        .enforce(
                            &mut simulation,
                            &SerialReduction,
                            Sensitivities {
                                p_last: &p_last,
                                dfdp: &dfdp,
                                dvdp: &dvdp,
                            },
                            0.4,
                            n as f64,
                            black_box(&mut p),
                        )
                        .expect("target reachable")
                })
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_enforce);
criterion_main!(benches);
