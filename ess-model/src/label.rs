//! Name-grammar label construction: `<typ>_u<uubnum>_c<chan>` plus optional
//! `_v<voltage*10>` and `_f<flabel>` components.

/// Builds a scalar-result key following the campaign's name grammar.
///
/// ```
/// use ess_model::label::LabelBuilder;
/// let key = LabelBuilder::new("itot").uubnum(12).chan(3).voltage(10.5).build();
/// assert_eq!(key, "itot_u0012_c3_v105");
/// ```
#[derive(Debug, Clone)]
pub struct LabelBuilder {
    typ: String,
    uubnum: Option<u32>,
    chan: Option<u32>,
    voltage: Option<f64>,
    flabel: Option<String>,
}

impl LabelBuilder {
    pub fn new(typ: impl Into<String>) -> Self {
        Self {
            typ: typ.into(),
            uubnum: None,
            chan: None,
            voltage: None,
            flabel: None,
        }
    }

    pub fn uubnum(mut self, uubnum: u32) -> Self {
        self.uubnum = Some(uubnum);
        self
    }

    pub fn chan(mut self, chan: u32) -> Self {
        self.chan = Some(chan);
        self
    }

    pub fn voltage(mut self, voltage: f64) -> Self {
        self.voltage = Some(voltage);
        self
    }

    pub fn freq(mut self, freq: f64) -> Self {
        self.flabel = Some(flabel(freq));
        self
    }

    pub fn build(self) -> String {
        let mut s = self.typ;
        if let Some(u) = self.uubnum {
            s.push_str(&format!("_u{:04}", u));
        }
        if let Some(c) = self.chan {
            s.push_str(&format!("_c{}", c));
        }
        if let Some(v) = self.voltage {
            s.push_str(&format!("_v{}", (v * 10.0).round() as i64));
        }
        if let Some(f) = self.flabel {
            s.push_str(&format!("_f{}", f));
        }
        s
    }
}

/// Compact frequency code derived from mantissa/exponent formatting, e.g.
/// `1e6`, `25e5`.
pub fn flabel(freq: f64) -> String {
    if freq == 0.0 {
        return "0".to_string();
    }
    let mut exponent = freq.abs().log10().floor() as i32;
    let mut mantissa = freq / 10f64.powi(exponent);
    // normalize so the mantissa is an integer with no trailing zero digits
    let mut mantissa_int = mantissa.round() as i64;
    while mantissa_int % 10 == 0 && mantissa_int != 0 {
        mantissa_int /= 10;
        exponent += 1;
    }
    mantissa = mantissa_int as f64;
    let _ = mantissa;
    format!("{}e{}", mantissa_int, exponent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_full_label() {
        let key = LabelBuilder::new("itot")
            .uubnum(12)
            .chan(3)
            .voltage(10.5)
            .build();
        assert_eq!(key, "itot_u0012_c3_v105");
    }

    #[test]
    fn builds_minimal_label() {
        assert_eq!(LabelBuilder::new("bme_temp1").build(), "bme_temp1");
    }

    #[test]
    fn flabel_formats_round_frequencies() {
        assert_eq!(flabel(1e6), "1e6");
        assert_eq!(flabel(2.5e6), "25e5");
    }
}
