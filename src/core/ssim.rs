use image::DynamicImage;
use image::imageops::FilterType;

/// Both images are compared at this square size.
pub const SSIM_SIDE: u32 = 256;

const WINDOW: usize = 7;
const DYNAMIC_RANGE: f64 = 255.0;
const K1: f64 = 0.01;
const K2: f64 = 0.03;

/// Grayscale, fixed-size copy of an image, ready for SSIM comparison.
///
/// Accepted images keep one of these so later candidates can be compared
/// without decoding the stored file again.
#[derive(Debug, Clone, PartialEq)]
pub struct GrayThumbnail {
    pixels: Vec<f64>,
}

impl GrayThumbnail {
    pub fn from_image(image: &DynamicImage) -> Self {
        let gray = image
            .resize_exact(SSIM_SIDE, SSIM_SIDE, FilterType::Triangle)
            .to_luma8();
        Self {
            pixels: gray.as_raw().iter().map(|&p| f64::from(p)).collect(),
        }
    }
}

/// Mean structural similarity over all fully contained 7×7 windows.
///
/// Uses the usual constants (K1 = 0.01, K2 = 0.03, L = 255) and sample
/// variances. The score is clamped into `[0, 1]`.
pub fn structural_similarity(a: &GrayThumbnail, b: &GrayThumbnail) -> f64 {
    let side = SSIM_SIDE as usize;
    let sx = SummedArea::new(side, |i| a.pixels[i]);
    let sy = SummedArea::new(side, |i| b.pixels[i]);
    let sxx = SummedArea::new(side, |i| a.pixels[i] * a.pixels[i]);
    let syy = SummedArea::new(side, |i| b.pixels[i] * b.pixels[i]);
    let sxy = SummedArea::new(side, |i| a.pixels[i] * b.pixels[i]);

    let c1 = (K1 * DYNAMIC_RANGE).powi(2);
    let c2 = (K2 * DYNAMIC_RANGE).powi(2);
    let n = (WINDOW * WINDOW) as f64;
    let sample = n / (n - 1.0);

    let positions = side - WINDOW + 1;
    let mut total = 0.0;
    for y in 0..positions {
        for x in 0..positions {
            let mu_x = sx.window(x, y) / n;
            let mu_y = sy.window(x, y) / n;
            let var_x = (sxx.window(x, y) / n - mu_x * mu_x) * sample;
            let var_y = (syy.window(x, y) / n - mu_y * mu_y) * sample;
            let cov = (sxy.window(x, y) / n - mu_x * mu_y) * sample;

            let numerator = (2.0 * mu_x * mu_y + c1) * (2.0 * cov + c2);
            let denominator = (mu_x * mu_x + mu_y * mu_y + c1) * (var_x + var_y + c2);
            total += numerator / denominator;
        }
    }

    (total / (positions * positions) as f64).clamp(0.0, 1.0)
}

/// Integral image with a zero row and column prepended.
struct SummedArea {
    stride: usize,
    table: Vec<f64>,
}

impl SummedArea {
    fn new(side: usize, value: impl Fn(usize) -> f64) -> Self {
        let stride = side + 1;
        let mut table = vec![0.0; stride * stride];
        for y in 0..side {
            let mut row = 0.0;
            for x in 0..side {
                row += value(y * side + x);
                table[(y + 1) * stride + x + 1] = table[y * stride + x + 1] + row;
            }
        }
        Self { stride, table }
    }

    fn window(&self, x: usize, y: usize) -> f64 {
        let (x1, y1) = (x + WINDOW, y + WINDOW);
        let at = |x: usize, y: usize| self.table[y * self.stride + x];
        at(x1, y1) - at(x, y1) - at(x1, y) + at(x, y)
    }
}
