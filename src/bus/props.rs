// Puck property names and their per-firmware index tables.
//
// Property indices are not stable across firmware: pucks older than
// version 40 use one flat list, newer pucks share a common block and then
// overlay a safety block and a motor block starting at COMMON_END.

use std::fmt;
use std::str::FromStr;

/// First firmware version using the common/safety/motor layout
pub const MODERN_FIRMWARE: i64 = 40;

macro_rules! properties {
    ($($variant:ident => $name:literal,)*) => {
        /// Symbolic puck property
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Property {
            $($variant,)*
        }

        impl Property {
            pub const ALL: &'static [Property] = &[$(Property::$variant,)*];

            /// Firmware name of the property
            pub fn name(self) -> &'static str {
                match self {
                    $(Property::$variant => $name,)*
                }
            }
        }
    };
}

properties! {
    Vers => "VERS",
    Role => "ROLE",
    Sn => "SN",
    Id => "ID",
    Error => "ERROR",
    Stat => "STAT",
    Addr => "ADDR",
    Value => "VALUE",
    Mode => "MODE",
    D => "D",
    Torq => "TORQ",
    Md => "MD",
    V => "V",
    B => "B",
    P => "P",
    P2 => "P2",
    E => "E",
    E2 => "E2",
    Mt => "MT",
    Mv => "MV",
    Mcv => "MCV",
    Mov => "MOV",
    Mofst => "MOFST",
    Iofst => "IOFST",
    Ptemp => "PTEMP",
    Upsecs => "UPSECS",
    Od => "OD",
    Mds => "MDS",
    Ap => "AP",
    Ap2 => "AP2",
    Mech => "MECH",
    Mech2 => "MECH2",
    Cts => "CTS",
    Cts2 => "CTS2",
    Dp => "DP",
    Dp2 => "DP2",
    Ot => "OT",
    Ot2 => "OT2",
    Ct => "CT",
    Ct2 => "CT2",
    Baud => "BAUD",
    Temp => "TEMP",
    Otemp => "OTEMP",
    LockKey => "_LOCK",
    Dig0 => "DIG0",
    Dig1 => "DIG1",
    Ana0 => "ANA0",
    Ana1 => "ANA1",
    Therm => "THERM",
    Vbus => "VBUS",
    Imotor => "IMOTOR",
    Vlogic => "VLOGIC",
    Ilogic => "ILOGIC",
    Grpa => "GRPA",
    Grpb => "GRPB",
    Grpc => "GRPC",
    Pidx => "PIDX",
    Zero => "ZERO",
    Sg => "SG",
    Hsg => "HSG",
    Lsg => "LSG",
    Ds => "_DS",
    Ivel => "IVEL",
    Ioff => "IOFF",
    Ioff2 => "IOFF2",
    Mpe => "MPE",
    En => "EN",
    Tstop => "TSTOP",
    Kp => "KP",
    Kd => "KD",
    Ki => "KI",
    Sample => "SAMPLE",
    Accel => "ACCEL",
    Tension => "TENSION",
    Units => "UNITS",
    Ratio => "RATIO",
    Log => "LOG",
    Dump => "DUMP",
    Log1 => "LOG1",
    Log2 => "LOG2",
    Log3 => "LOG3",
    Log4 => "LOG4",
    Gain1 => "GAIN1",
    Gain2 => "GAIN2",
    Gain3 => "GAIN3",
    Offset1 => "OFFSET1",
    Offset2 => "OFFSET2",
    Offset3 => "OFFSET3",
    Pen => "PEN",
    Safe => "SAFE",
    Save => "SAVE",
    Load => "LOAD",
    Def => "DEF",
    Vl1 => "VL1",
    Vl2 => "VL2",
    Tl1 => "TL1",
    Tl2 => "TL2",
    Voltl1 => "VOLTL1",
    Voltl2 => "VOLTL2",
    Volth1 => "VOLTH1",
    Volth2 => "VOLTH2",
    Maxpwr => "MAXPWR",
    Pwr => "PWR",
    Ifault => "IFAULT",
    Ikp => "IKP",
    Iki => "IKI",
    Ikcor => "IKCOR",
    Vnom => "VNOM",
    Tenst => "TENST",
    Tenso => "TENSO",
    Jidx => "JIDX",
    Ipnm => "IPNM",
    Halls => "HALLS",
    Hallh => "HALLH",
    Hallh2 => "HALLH2",
    Poles => "POLES",
    Ecmax => "ECMAX",
    Ecmin => "ECMIN",
    Lflags => "LFLAGS",
    Lctc => "LCTC",
    Lcvc => "LCVC",
    Lock => "LOCK",
    Fet0 => "FET0",
    Fet1 => "FET1",
    Cmd => "CMD",
    X0 => "X0",
    X1 => "X1",
    X2 => "X2",
    X3 => "X3",
    X4 => "X4",
    X5 => "X5",
    X6 => "X6",
    X7 => "X7",
    T => "T",
    M => "M",
    M2 => "M2",
    Hold => "HOLD",
    Tie => "TIE",
    Find => "FIND",
    Isq => "ISQ",
    Tetae => "TETAE",
    Lcv => "LCV",
    Lfv => "LFV",
    Lfs => "LFS",
    Lfap => "LFAP",
    Lfdp => "LFDP",
    Lft => "LFT",
    Value32 => "VALUE32",
}

impl Property {
    pub const COUNT: usize = Self::ALL.len();
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown puck property: {0}")]
pub struct UnknownProperty(pub String);

impl FromStr for Property {
    type Err = UnknownProperty;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Property::ALL
            .iter()
            .copied()
            .find(|p| p.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownProperty(s.to_string()))
    }
}

use Property::*;

const LEGACY: &[Property] = &[
    Vers, Role, Sn, Id, Error, Stat, Addr, Value, Mode, D, Torq, P, V, E, B, Md, Mt, Mv, Mcv, Mov,
    Mofst, Iofst, Ptemp, Upsecs, Od, Mds, Ap, Ap2, Mech, Mech2, Cts, Cts2, Dp, Dp2, Ot, Ot2, Ct,
    Ct2, Baud, Temp, Otemp, LockKey, Dig0, Dig1, Ana0, Ana1, Therm, Vbus, Imotor, Vlogic, Ilogic,
    Grpa, Grpb, Grpc, Pidx, Zero, Sg, Hsg, Lsg, Ds, Ivel, Ioff, Mpe, En, Tstop, Kp, Kd, Ki,
    Sample, Accel, Tension, Units, Ratio, Log, Dump, Log1, Log2, Log3, Log4, Gain1, Gain2, Gain3,
    Offset1, Offset2, Offset3, Pen, Safe, Save, Load, Def, Vl1, Vl2, Tl1, Tl2, Voltl1, Voltl2,
    Volth1, Volth2, Maxpwr, Pwr, Ifault, Ikp, Iki, Ikcor, Vnom, Tenst, Tenso, Jidx, Ipnm,
];

const COMMON: &[Property] = &[
    Vers, Role, Sn, Id, Error, Stat, Addr, Value, Mode, Temp, Ptemp, Otemp, Baud, LockKey, Dig0,
    Dig1, Fet0, Fet1, Ana0, Ana1, Therm, Vbus, Imotor, Vlogic, Ilogic, Sg, Grpa, Grpb, Grpc, Cmd,
    Save, Load, Def, Find, X0, X1, X2, X3, X4, X5, X6, X7,
];

const SAFETY: &[Property] = &[
    Zero, Pen, Safe, Vl1, Vl2, Tl1, Tl2, Voltl1, Voltl2, Volth1, Volth2, Pwr, Maxpwr, Ifault, Vnom,
];

const MOTOR: &[Property] = &[
    T, Mt, V, Mv, Mcv, Mov, P, P2, Dp, Dp2, E, E2, Ot, Ot2, Ct, Ct2, M, M2, Ds, Mofst, Iofst,
    Upsecs, Od, Mds, Mech, Mech2, Cts, Cts2, Pidx, Hsg, Lsg, Ivel, Ioff, Ioff2, Mpe, En, Tstop,
    Kp, Kd, Ki, Accel, Tenst, Tenso, Jidx, Ipnm, Halls, Hallh, Hallh2, Poles, Ikp, Iki, Ikcor,
    Hold, Tie, Ecmax, Ecmin, Lflags, Lctc, Lcvc,
];

/// Property-name to index mapping for one firmware generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyTable {
    firmware: i64,
    index: [Option<u8>; Property::COUNT],
    prop_end: u8,
}

impl PropertyTable {
    /// Build the table matching a puck's firmware version
    pub fn for_firmware(firmware: i64) -> Self {
        let mut table = Self {
            firmware,
            index: [None; Property::COUNT],
            prop_end: 0,
        };

        if firmware < MODERN_FIRMWARE {
            table.prop_end = table.assign(0, LEGACY);
            table.alias(T, Torq);
            table.alias(Fet0, B);
            table.alias(Fet1, Tension);
        } else {
            let common_end = table.assign(0, COMMON);
            table.assign(common_end, SAFETY);
            table.prop_end = table.assign(common_end, MOTOR);
            table.alias(Ap, P);
            table.alias(Tension, Fet1);
        }
        table
    }

    fn assign(&mut self, start: u8, props: &[Property]) -> u8 {
        let mut i = start;
        for &p in props {
            self.index[p as usize] = Some(i);
            i += 1;
        }
        i
    }

    fn alias(&mut self, alias: Property, of: Property) {
        self.index[alias as usize] = self.index[of as usize];
    }

    /// Index of `property`, if this firmware has it
    pub fn get(&self, property: Property) -> Option<u8> {
        self.index[property as usize]
    }

    /// One past the last defined index
    pub fn prop_end(&self) -> u8 {
        self.prop_end
    }

    pub fn firmware(&self) -> i64 {
        self.firmware
    }

    pub fn is_legacy(&self) -> bool {
        self.firmware < MODERN_FIRMWARE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modern_indices() {
        let t = PropertyTable::for_firmware(130);
        assert_eq!(t.get(Vers), Some(0));
        assert_eq!(t.get(Stat), Some(5));
        assert_eq!(t.get(Mode), Some(8));
        assert_eq!(t.get(Grpb), Some(27));
        assert_eq!(t.get(T), Some(42));
        assert_eq!(t.get(Zero), Some(42));
        assert_eq!(t.get(Ifault), Some(55));
        assert_eq!(t.get(P), Some(48));
        assert_eq!(t.get(Ap), Some(48));
        assert_eq!(t.get(Mech), Some(66));
        assert_eq!(t.get(Cts), Some(68));
        assert_eq!(t.get(Pidx), Some(70));
        assert_eq!(t.get(Ipnm), Some(86));
        assert_eq!(t.get(Tension), t.get(Fet1));
        assert_eq!(t.get(Torq), None);
        assert_eq!(t.prop_end(), 101);
        assert!(!t.is_legacy());
    }

    #[test]
    fn test_legacy_indices() {
        let t = PropertyTable::for_firmware(35);
        assert_eq!(t.get(Stat), Some(5));
        assert_eq!(t.get(Torq), Some(10));
        assert_eq!(t.get(T), Some(10));
        assert_eq!(t.get(Ap), Some(26));
        assert_eq!(t.get(Mech), Some(28));
        assert_eq!(t.get(Cts), Some(30));
        assert_eq!(t.get(Grpb), Some(52));
        assert_eq!(t.get(Pidx), Some(54));
        assert_eq!(t.get(Zero), Some(55));
        assert_eq!(t.get(Ifault), Some(100));
        assert_eq!(t.get(Ipnm), Some(108));
        assert_eq!(t.get(Fet0), t.get(B));
        assert_eq!(t.get(Halls), None);
        assert_eq!(t.prop_end(), 109);
        assert!(t.is_legacy());
    }

    #[test]
    fn test_stat_index_is_layout_independent() {
        for vers in [0, 39, 40, 200] {
            assert_eq!(PropertyTable::for_firmware(vers).get(Stat), Some(5));
        }
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("ap".parse::<Property>().unwrap(), Ap);
        assert_eq!("_LOCK".parse::<Property>().unwrap(), LockKey);
        assert_eq!(Ipnm.to_string(), "IPNM");
        assert!("NOPE".parse::<Property>().is_err());
    }
}
