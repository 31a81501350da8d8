// THEORY:
// The `BlobDetector` is the connected-component engine shared by both thresholding
// passes of the region detector. Each pass produces its own binary "ink" mask; this
// module turns that mask into spatially coherent components and summarizes each one.
//
// Key architectural principles & algorithm steps:
// 1.  **Region Growing**: Every unvisited foreground pixel seeds a new component. The
//     component expands through its 4-connected foreground neighbours with an explicit
//     stack (no recursion), so a page-sized smear cannot overflow the call stack.
// 2.  **Weighted Aggregation**: While growing, each pixel contributes a caller-defined
//     weight (for instance "how much darker than its neighbourhood it is"). The
//     component reports the mean weight, which is how a pass turns "how strongly did
//     this satisfy my criterion" into a measured, per-region number.
// 3.  **Stateless Utility**: `find_components` reads a mask for a single page and
//     returns the components for that page. It has no memory of earlier pages.

pub mod blob_detector {
    /// A pixel coordinate on the page grid.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PixelPoint {
        pub x: u32,
        pub y: u32,
    }

    /// Summary of one 4-connected foreground component.
    #[derive(Debug, Clone, PartialEq)]
    pub struct Component {
        /// Top-left pixel (inclusive).
        pub min: PixelPoint,
        /// Bottom-right pixel (inclusive).
        pub max: PixelPoint,
        /// Number of foreground pixels in the component.
        pub pixel_count: usize,
        /// Mean of the caller-supplied per-pixel weight over the component.
        pub mean_weight: f64,
    }

    impl Component {
        /// Width of the enclosing box in pixels.
        pub fn width(&self) -> u32 {
            self.max.x - self.min.x + 1
        }

        pub fn height(&self) -> u32 {
            self.max.y - self.min.y + 1
        }

        /// Share of the enclosing box covered by foreground pixels. A solidly
        /// shaded rectangle is close to 1.0, a thin outline or a letter is not.
        pub fn fill_ratio(&self) -> f64 {
            self.pixel_count as f64 / (self.width() as f64 * self.height() as f64)
        }

        /// Enclosing box as half-open page coordinates `[x_min, y_min, x_max, y_max]`.
        pub fn page_box(&self) -> [f64; 4] {
            [
                self.min.x as f64,
                self.min.y as f64,
                (self.max.x + 1) as f64,
                (self.max.y + 1) as f64,
            ]
        }
    }

    /// Finds every 4-connected component of `mask` (row-major, `width * height`).
    ///
    /// `weight` is called once per foreground pixel with its flat index.
    pub fn find_components<F>(mask: &[bool], width: u32, height: u32, weight: F) -> Vec<Component>
    where
        F: Fn(usize) -> f64,
    {
        let w = width as usize;
        let h = height as usize;
        debug_assert_eq!(mask.len(), w * h);

        let mut visited = vec![false; w * h];
        let mut components = Vec::new();
        let mut stack: Vec<usize> = Vec::new();

        for seed in 0..w * h {
            if !mask[seed] || visited[seed] {
                continue;
            }

            // --- Region Growing ---
            visited[seed] = true;
            stack.push(seed);

            let mut min_x = u32::MAX;
            let mut min_y = u32::MAX;
            let mut max_x = 0u32;
            let mut max_y = 0u32;
            let mut pixel_count = 0usize;
            let mut total_weight = 0.0;

            while let Some(index) = stack.pop() {
                let x = index % w;
                let y = index / w;

                min_x = min_x.min(x as u32);
                min_y = min_y.min(y as u32);
                max_x = max_x.max(x as u32);
                max_y = max_y.max(y as u32);
                pixel_count += 1;
                total_weight += weight(index);

                // Check all 4 direct neighbors (not diagonals).
                let mut visit = |n: usize| {
                    if mask[n] && !visited[n] {
                        visited[n] = true;
                        stack.push(n);
                    }
                };
                if x > 0 {
                    visit(index - 1);
                }
                if x + 1 < w {
                    visit(index + 1);
                }
                if y > 0 {
                    visit(index - w);
                }
                if y + 1 < h {
                    visit(index + w);
                }
            }

            // --- Data Aggregation ---
            components.push(Component {
                min: PixelPoint { x: min_x, y: min_y },
                max: PixelPoint { x: max_x, y: max_y },
                pixel_count,
                mean_weight: total_weight / pixel_count as f64,
            });
        }

        components
    }
}
