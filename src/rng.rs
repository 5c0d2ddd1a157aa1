//! Deterministic seeded RNG for reproducible simulations.
//!
//! SplitMix64 expands the seed into xoshiro256** state; the same finalizer
//! (`mix64`) is used standalone wherever the graph generator needs a value
//! that is a pure function of its inputs. Distribution sampling is built
//! from the uniform stream: Box-Muller for normals, exp for lognormals,
//! Marsaglia-Tsang for gammas.

/// SplitMix64 finalizer. Pure function of its input, used for deterministic
/// per-node values (evidence estimates, decide tie-breakers).
#[inline]
pub fn mix64(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58476d1ce4e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d049bb133111eb);
    x ^= x >> 31;
    x
}

/// Seeded xoshiro256** generator.
pub struct SeededRng {
    s: [u64; 4],
}

impl SeededRng {
    pub fn new(seed: u64) -> Self {
        // SplitMix64 stream seeds the four state words.
        let mut s = [0u64; 4];
        let mut x = seed;
        for word in &mut s {
            x = x.wrapping_add(0x9e3779b97f4a7c15);
            *word = mix64(x);
        }
        SeededRng { s }
    }

    #[inline]
    fn rotl(x: u64, k: u32) -> u64 {
        x.rotate_left(k)
    }

    pub fn next_u64(&mut self) -> u64 {
        let result = Self::rotl(self.s[0].wrapping_add(self.s[3]), 23).wrapping_add(self.s[0]);
        let t = self.s[1] << 17;
        self.s[2] ^= self.s[0];
        self.s[3] ^= self.s[1];
        self.s[1] ^= self.s[2];
        self.s[0] ^= self.s[3];
        self.s[2] ^= t;
        self.s[3] = Self::rotl(self.s[3], 45);
        result
    }

    /// Uniform in [0, 1) with 53 bits of precision.
    pub fn uniform01(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / 9007199254740992.0 // 2^53
    }

    pub fn uniform(&mut self, a: f64, b: f64) -> f64 {
        a + self.uniform01() * (b - a)
    }

    pub fn bernoulli(&mut self, p: f64) -> bool {
        if p <= 0.0 {
            return false;
        }
        if p >= 1.0 {
            return true;
        }
        self.uniform01() < p
    }

    pub fn normal(&mut self, mean: f64, stddev: f64) -> f64 {
        let mut u1 = self.uniform01();
        let mut u2 = self.uniform01();
        while u1 <= 0.0 || u1 >= 1.0 {
            u1 = self.uniform01();
        }
        while u2 <= 0.0 || u2 >= 1.0 {
            u2 = self.uniform01();
        }
        mean + stddev * normal_from_uniform(u1, u2)
    }

    pub fn lognormal(&mut self, mu: f64, sigma: f64) -> f64 {
        let u1 = self.uniform01();
        let mut u2 = self.uniform01();
        while u2 <= 0.0 || u2 >= 1.0 {
            u2 = self.uniform01();
        }
        let z = normal_from_uniform(u1, u2);
        let x = (mu + sigma * z).exp();
        if x > 0.0 {
            x
        } else {
            f64::MIN_POSITIVE
        }
    }

    /// Marsaglia-Tsang; the shape < 1 case boosts and corrects.
    pub fn gamma(&mut self, shape: f64, scale: f64) -> f64 {
        if shape < 1.0 {
            let boosted = self.gamma(shape + 1.0, scale);
            return boosted * self.uniform01().powf(1.0 / shape);
        }
        let d = shape - 1.0 / 3.0;
        let c = 1.0 / (9.0 * d).sqrt();
        loop {
            let mut x;
            let mut v;
            loop {
                x = self.normal(0.0, 1.0);
                v = 1.0 + c * x;
                if v > 0.0 {
                    break;
                }
            }
            v = v * v * v;
            let u = self.uniform01();
            if u < 1.0 - 0.0331 * (x * x) * (x * x) {
                return d * v * scale;
            }
            if u.ln() < 0.5 * x * x + d * (1.0 - v + v.ln()) {
                return d * v * scale;
            }
        }
    }
}

/// Box-Muller transform.
#[inline]
fn normal_from_uniform(u1: f64, u2: f64) -> f64 {
    if u1 <= 0.0 || u1 >= 1.0 {
        return 0.0;
    }
    let r = (-2.0 * u1.ln()).sqrt();
    r * (2.0 * std::f64::consts::PI * u2).cos()
}
