use crate::{
    error::EvalError,
    floating_type_mod::{FT, PI},
    V3,
};

/// Smoothing kernel `W(xij, h)` with compact support `radius_scale() * h`.
pub trait SmoothingKernel: Send + Sync {
    /// `xij` is `x_i - x_j` and `rij` its length.
    fn kernel(&self, xij: &V3, rij: FT, h: FT) -> FT;

    /// Gradient of the kernel with respect to `x_i`.
    fn gradient(&self, xij: &V3, rij: FT, h: FT) -> V3;

    fn radius_scale(&self) -> FT;
}

/**
 * q is the distance divided by the support radius 2h.
 */
pub fn cubic_kernel_unnormalized(q: FT) -> FT {
    if q < 0.5 {
        6. * (q * q * q - q * q) + 1.
    } else if q < 1. {
        let v = 1. - q;
        2. * (v * v * v)
    } else {
        0.
    }
}

pub fn cubic_kernel_unnormalized_deriv(q: FT) -> FT {
    if q < 0.5 {
        18. * q * q - 12. * q
    } else if q < 1. {
        let v = 1. - q;
        -6. * v * v
    } else {
        0.
    }
}

/// Cubic B-spline with support radius `2h`.
#[derive(Debug, Clone, Copy)]
pub struct CubicSpline {
    dim: usize,
}

impl CubicSpline {
    pub fn new(dim: usize) -> Result<Self, EvalError> {
        match dim {
            1 | 2 | 3 => Ok(CubicSpline { dim }),
            _ => Err(EvalError::InvalidDimension(dim)),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    fn norm_factor(&self, h: FT) -> FT {
        match self.dim {
            1 => 2. / (3. * h),
            2 => 10. / (7. * PI * (h * h)),
            _ => 1. / (PI * (h * h * h)),
        }
    }
}

impl SmoothingKernel for CubicSpline {
    fn kernel(&self, _xij: &V3, rij: FT, h: FT) -> FT {
        self.norm_factor(h) * cubic_kernel_unnormalized(rij / (2. * h))
    }

    fn gradient(&self, xij: &V3, rij: FT, h: FT) -> V3 {
        let q: FT = rij / (2. * h);
        if q <= 1.0e-5 {
            return V3::zeros();
        }

        self.norm_factor(h) * cubic_kernel_unnormalized_deriv(q) / (2. * h) * (xij / rij)
    }

    fn radius_scale(&self) -> FT {
        2.
    }
}

#[cfg(test)]
fn integrate_on_grid(kernel: &CubicSpline, h: FT, grid_size: usize) -> FT {
    use crate::vec3f;

    let support_radius = kernel.radius_scale() * h;
    let cell_len = 2. * support_radius / grid_size as FT;
    let coord = |i: usize| (i as FT + 0.5) * cell_len - support_radius;

    let mut integral = 0.;
    match kernel.dim() {
        1 => {
            for x in 0..grid_size {
                let p = vec3f(coord(x), 0., 0.);
                integral += kernel.kernel(&p, p.norm(), h) * cell_len;
            }
        }
        2 => {
            for y in 0..grid_size {
                for x in 0..grid_size {
                    let p = vec3f(coord(x), coord(y), 0.);
                    integral += kernel.kernel(&p, p.norm(), h) * cell_len * cell_len;
                }
            }
        }
        _ => {
            for z in 0..grid_size {
                for y in 0..grid_size {
                    for x in 0..grid_size {
                        let p = vec3f(coord(x), coord(y), coord(z));
                        integral += kernel.kernel(&p, p.norm(), h) * cell_len * cell_len * cell_len;
                    }
                }
            }
        }
    }
    integral
}

#[test]
fn cubic_spline_integrates_to_one() {
    let h = 5.;
    for (dim, grid_size, allow_deviation) in [(1, 2000, 1.00001), (2, 200, 1.00001), (3, 60, 1.005)] {
        let kernel = CubicSpline::new(dim).unwrap();
        let integral = integrate_on_grid(&kernel, h, grid_size);
        println!("Integration of {}D cubic kernel with h={:.2}: {}", dim, h, integral);
        assert!(1.0 / allow_deviation <= integral);
        assert!(integral <= allow_deviation / 1.0);
    }
}

#[test]
fn cubic_spline_gradient_matches_finite_differences() {
    use crate::{assert_ft_approx_eq, vec3f};

    let h = 0.5;
    let kernel = CubicSpline::new(3).unwrap();
    let eps = 1e-6;
    let w = |p: V3| kernel.kernel(&p, p.norm(), h);

    for point in [vec3f(0.1, 0.2, -0.05), vec3f(0.6, -0.3, 0.2), vec3f(-0.2, 0.7, 0.4)] {
        let analytical = kernel.gradient(&point, point.norm(), h);
        for axis in 0..3 {
            let mut offset = V3::zeros();
            offset[axis] = eps * 0.5;
            let approx = (w(point + offset) - w(point - offset)) / eps;
            assert_ft_approx_eq(analytical[axis], approx, 1e-5, || {
                format!("gradient component {} at {:?}", axis, point)
            });
        }
    }
}

#[test]
fn cubic_spline_rejects_invalid_dimension() {
    assert!(matches!(CubicSpline::new(0), Err(EvalError::InvalidDimension(0))));
    assert!(matches!(CubicSpline::new(4), Err(EvalError::InvalidDimension(4))));
}

#[test]
fn cubic_spline_gradient_vanishes_at_origin() {
    let kernel = CubicSpline::new(2).unwrap();
    assert_eq!(kernel.gradient(&V3::zeros(), 0., 1.), V3::zeros());
}
